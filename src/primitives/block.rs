// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::{Decode, Encode};
use std::fmt;

/// Block record as the AT subsystem sees it. Validation and production
/// live elsewhere; the VM only ever reads height, signature and timestamp.
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockData {
    pub height: u32,
    pub signature: Vec<u8>,
    pub timestamp: i64,
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockData")
            .field("height", &self.height)
            .field("signature", &hex::encode(&self.signature))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Height + signature only. Block-hash queries from the VM request
/// summaries so the repository can skip loading transactions.
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockSummary {
    pub height: u32,
    pub signature: Vec<u8>,
}

impl fmt::Debug for BlockSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSummary")
            .field("height", &self.height)
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}
