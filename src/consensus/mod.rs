// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use serde::{Deserialize, Serialize};

/// Unscaled monetary amount with 8 implied decimal places.
pub type Money = u64;

/// One whole unit of the native asset, in unscaled form.
pub const COIN: Money = 100_000_000;

/// Native asset id. ATs hold and transfer the native asset only.
pub const NATIVE_ASSET_ID: u64 = 0;

/// Creator public key carried on system-generated (AT-emitted)
/// transactions. Consensus-stable; no account owns the matching secret.
pub const SYSTEM_PUBLIC_KEY: [u8; 32] = [
    0x1f, 0x8e, 0x37, 0xaa, 0x2c, 0x59, 0xd1, 0x04, 0x6b, 0xe5, 0x90, 0x13, 0x7d, 0xc8, 0x42,
    0xf0, 0xa6, 0x3b, 0x0e, 0x75, 0x5a, 0x21, 0xcd, 0x98, 0x84, 0x4d, 0xe2, 0x09, 0xb7, 0x36,
    0xfc, 0x50,
];

/// Consensus parameters of the AT execution engine. Passed explicitly into
/// the runner and the platform API; there is no process-wide instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtSettings {
    /// Fee debited per consumed step, unscaled.
    pub fee_per_step: Money,

    /// Step budget for one AT round. Overrun is fatal for the round.
    pub max_steps_per_round: u32,

    /// Step cost of the EXT_FUN opcode family.
    pub steps_per_function_call: u32,

    /// Block-time approximation used by `addMinutesToTimestamp`.
    pub minutes_per_block: u32,
}

impl Default for AtSettings {
    fn default() -> Self {
        Self {
            fee_per_step: 73,
            max_steps_per_round: 500,
            steps_per_function_call: 10,
            minutes_per_block: 1,
        }
    }
}

impl AtSettings {
    /// Panics if settings are invalid.
    pub fn validate(&self) {
        assert!(self.max_steps_per_round > 0, "AT step budget must be positive");
        assert!(
            self.steps_per_function_call > 0,
            "AT function-call cost must be positive"
        );
        assert!(self.minutes_per_block > 0, "minutes per block must be positive");
    }
}
