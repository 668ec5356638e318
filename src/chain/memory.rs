// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::at::AtData;
use crate::chain::{Repository, RepositoryErr};
use crate::consensus::Money;
use crate::primitives::{Address, BlockData, BlockSummary, Signature, TransactionData};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<u32, BlockData>,
    transactions: BTreeMap<u32, Vec<TransactionData>>,
    balances: HashMap<Address, Money>,
    last_references: HashMap<Address, Signature>,
    ats: BTreeMap<Address, AtData>,
    at_creation_heights: HashMap<Address, u32>,
}

/// In-memory ledger used by tests and the standalone tools. Not a
/// consensus-grade store: no persistence, no pruning.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a block and its transactions at the next height. Updates
    /// last-references for transaction creators.
    pub fn push_block(&self, block: BlockData, transactions: Vec<TransactionData>) {
        let mut inner = self.inner.write();

        for tx in &transactions {
            if let Some(signature) = tx.signature() {
                let creator = tx.base().creator_public_key.to_address();
                inner.last_references.insert(creator, *signature);
            }
        }

        inner.transactions.insert(block.height, transactions);
        inner.blocks.insert(block.height, block);
    }

    pub fn set_account_balance(&self, address: &Address, balance: Money) {
        self.inner.write().balances.insert(address.clone(), balance);
    }

    pub fn set_account_last_reference(&self, address: &Address, reference: Signature) {
        self.inner
            .write()
            .last_references
            .insert(address.clone(), reference);
    }

    /// Registers a deployed AT at the given creation height.
    pub fn deploy_at(&self, at: AtData, creation_height: u32) {
        let mut inner = self.inner.write();
        inner
            .at_creation_heights
            .insert(at.address.clone(), creation_height);
        inner.ats.insert(at.address.clone(), at);
    }
}

impl Repository for MemoryRepository {
    fn blockchain_height(&self) -> Result<u32, RepositoryErr> {
        self.inner
            .read()
            .blocks
            .keys()
            .next_back()
            .copied()
            .ok_or(RepositoryErr::NotFound)
    }

    fn last_block(&self) -> Result<BlockData, RepositoryErr> {
        self.inner
            .read()
            .blocks
            .values()
            .next_back()
            .cloned()
            .ok_or(RepositoryErr::NotFound)
    }

    fn block_at_height(&self, height: u32) -> Result<Option<BlockData>, RepositoryErr> {
        Ok(self.inner.read().blocks.get(&height).cloned())
    }

    fn block_summaries(&self, from: u32, to: u32) -> Result<Vec<BlockSummary>, RepositoryErr> {
        Ok(self
            .inner
            .read()
            .blocks
            .range(from..=to)
            .map(|(height, block)| BlockSummary {
                height: *height,
                signature: block.signature.clone(),
            })
            .collect())
    }

    fn transactions_in_block(&self, height: u32) -> Result<Vec<TransactionData>, RepositoryErr> {
        Ok(self
            .inner
            .read()
            .transactions
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    fn transaction_at(
        &self,
        height: u32,
        sequence: u32,
    ) -> Result<Option<TransactionData>, RepositoryErr> {
        Ok(self
            .inner
            .read()
            .transactions
            .get(&height)
            .and_then(|txs| txs.get(sequence as usize))
            .cloned())
    }

    fn transaction_by_signature(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionData>, RepositoryErr> {
        let inner = self.inner.read();

        for txs in inner.transactions.values() {
            for tx in txs {
                if tx.signature() == Some(signature) {
                    return Ok(Some(tx.clone()));
                }
            }
        }

        Ok(None)
    }

    fn account_last_reference(
        &self,
        address: &Address,
    ) -> Result<Option<Signature>, RepositoryErr> {
        Ok(self.inner.read().last_references.get(address).copied())
    }

    fn account_balance(&self, address: &Address) -> Result<Money, RepositoryErr> {
        Ok(self.inner.read().balances.get(address).copied().unwrap_or(0))
    }

    fn active_ats(&self) -> Result<Vec<AtData>, RepositoryErr> {
        // BTreeMap keyed by address already yields canonical ascending order
        Ok(self.inner.read().ats.values().cloned().collect())
    }

    fn at_data(&self, address: &Address) -> Result<Option<AtData>, RepositoryErr> {
        Ok(self.inner.read().ats.get(address).cloned())
    }

    fn save_at(&self, at: &AtData) -> Result<(), RepositoryErr> {
        self.inner.write().ats.insert(at.address.clone(), at.clone());
        Ok(())
    }

    fn at_creation_height(&self, address: &Address) -> Result<u32, RepositoryErr> {
        self.inner
            .read()
            .at_creation_heights
            .get(address)
            .copied()
            .ok_or(RepositoryErr::NotFound)
    }
}
