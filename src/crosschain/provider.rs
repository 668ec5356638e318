// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use std::fmt;

/// One unspent output as reported by the external node.
#[derive(Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    /// Transaction id, internal byte order.
    pub hash: [u8; 32],
    pub index: u32,
    pub height: u32,
    pub value: u64,
    pub script_pub_key: Vec<u8>,
}

impl fmt::Debug for UnspentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnspentOutput")
            .field("hash", &hex::encode(self.hash))
            .field("index", &self.index)
            .field("height", &self.height)
            .field("value", &self.value)
            .finish()
    }
}

/// A confirmed transaction touching some address, as reported by the
/// external node's history index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionHash {
    pub height: u32,
    pub tx_hash: String,
}

#[derive(Debug)]
pub enum ForeignBlockchainErr {
    /// Transport or availability failure against the external node
    Network(String),

    /// The node returned something we could not interpret
    InvalidResponse(&'static str),

    /// Requested entity does not exist
    NotFound,

    /// Fewer blocks available than the protocol requires
    NotEnoughBlocks,

    /// The provider implementation does not support this query
    Unsupported(&'static str),

    /// Generic error
    Error(&'static str),
}

impl fmt::Display for ForeignBlockchainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "foreign blockchain network error: {msg}"),
            Self::InvalidResponse(msg) => write!(f, "invalid foreign blockchain response: {msg}"),
            Self::NotFound => write!(f, "foreign blockchain entity not found"),
            Self::NotEnoughBlocks => write!(f, "not enough foreign blocks available"),
            Self::Unsupported(msg) => write!(f, "unsupported foreign blockchain query: {msg}"),
            Self::Error(msg) => write!(f, "foreign blockchain error: {msg}"),
        }
    }
}

/// Opaque client for the external Bitcoin-like node.
///
/// Contract: `raw_block_headers` returns legacy 80-byte headers (version 4,
/// prevHash 32, merkleRoot 32, timestamp 4, bits 4, nonce 4) — the
/// median-time-past computation depends on that layout. Implementations own
/// their transport, timeouts and retries, and must be safe for concurrent
/// use across unrelated swaps.
pub trait BlockchainProvider {
    /// Height of the external chain tip.
    fn current_height(&self) -> Result<u32, ForeignBlockchainErr>;

    /// Raw headers for `count` blocks starting at `start_height`.
    fn raw_block_headers(
        &self,
        start_height: u32,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, ForeignBlockchainErr>;

    /// Confirmed balance of the given output script.
    fn confirmed_balance(&self, script_pub_key: &[u8]) -> Result<u64, ForeignBlockchainErr>;

    /// Unspent outputs paying to the given output script.
    fn unspent_outputs(
        &self,
        script_pub_key: &[u8],
    ) -> Result<Vec<UnspentOutput>, ForeignBlockchainErr>;

    /// Raw bytes of the transaction with the given id (internal byte order).
    fn raw_transaction(&self, tx_hash: &[u8; 32]) -> Result<Vec<u8>, ForeignBlockchainErr>;

    /// Confirmed transactions involving the given output script.
    fn address_transactions(
        &self,
        script_pub_key: &[u8],
    ) -> Result<Vec<TransactionHash>, ForeignBlockchainErr>;

    /// Broadcasts a raw transaction; returns its id as hex.
    fn broadcast_transaction(&self, raw: &[u8]) -> Result<String, ForeignBlockchainErr>;
}
