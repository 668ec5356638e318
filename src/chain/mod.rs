// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub mod memory;

use crate::at::AtData;
use crate::consensus::Money;
use crate::primitives::{Address, BlockData, BlockSummary, Signature, TransactionData};
use bincode::error::DecodeError as BincodeDecodeErr;
use bincode::error::EncodeError as BincodeEncodeErr;

pub use memory::MemoryRepository;

/// Ledger access as seen by the AT subsystem. All reads are stable for the
/// duration of one block's AT processing; writes are collected by the caller
/// and applied atomically with block application.
pub trait Repository {
    /// Height of the chain tip.
    fn blockchain_height(&self) -> Result<u32, RepositoryErr>;

    /// The chain tip.
    fn last_block(&self) -> Result<BlockData, RepositoryErr>;

    /// Block at the given height, if present.
    fn block_at_height(&self, height: u32) -> Result<Option<BlockData>, RepositoryErr>;

    /// Height + signature for every block in `from..=to`.
    fn block_summaries(&self, from: u32, to: u32) -> Result<Vec<BlockSummary>, RepositoryErr>;

    /// Transactions of the block at `height`, in block order.
    fn transactions_in_block(&self, height: u32) -> Result<Vec<TransactionData>, RepositoryErr>;

    /// Transaction at (height, sequence-within-block), if present.
    fn transaction_at(
        &self,
        height: u32,
        sequence: u32,
    ) -> Result<Option<TransactionData>, RepositoryErr>;

    /// Transaction carrying the given signature, if present.
    fn transaction_by_signature(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionData>, RepositoryErr>;

    /// Signature of the most recent confirmed transaction by this account.
    fn account_last_reference(
        &self,
        address: &Address,
    ) -> Result<Option<Signature>, RepositoryErr>;

    /// Confirmed native-asset balance of the account.
    fn account_balance(&self, address: &Address) -> Result<Money, RepositoryErr>;

    /// Every deployed AT, ascending by AT address. The canonical execution
    /// order of the per-block runner.
    fn active_ats(&self) -> Result<Vec<AtData>, RepositoryErr>;

    /// A single AT's record, if deployed.
    fn at_data(&self, address: &Address) -> Result<Option<AtData>, RepositoryErr>;

    /// Persists an AT record (state blob included).
    fn save_at(&self, at: &AtData) -> Result<(), RepositoryErr>;

    /// Block height the AT was deployed at.
    fn at_creation_height(&self, address: &Address) -> Result<u32, RepositoryErr>;
}

#[derive(Debug)]
pub enum RepositoryErr {
    /// A record that must exist is missing
    NotFound,

    /// Stored data failed to decode
    CorruptData,

    /// Bincode encode error
    BincodeEncode(BincodeEncodeErr),

    /// Bincode decode error
    BincodeDecode(BincodeDecodeErr),

    /// Generic error
    Error(&'static str),
}

impl From<BincodeEncodeErr> for RepositoryErr {
    fn from(other: BincodeEncodeErr) -> Self {
        Self::BincodeEncode(other)
    }
}

impl From<BincodeDecodeErr> for RepositoryErr {
    fn from(other: BincodeDecodeErr) -> Self {
        Self::BincodeDecode(other)
    }
}
