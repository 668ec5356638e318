// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub mod api;
pub mod machine;

pub use api::QuartzAtApi;
pub use machine::{ExecutionErr, MachineState, OpCode, PlatformApi};

use crate::chain::{Repository, RepositoryErr};
use crate::consensus::{AtSettings, Money};
use crate::primitives::{Address, PublicKey, TransactionData};
use bincode::{Decode, Encode};
use log::debug;

/// Packed 64-bit AT timestamp: block height in the high 32 bits,
/// transaction sequence within the block in the low 32. Ordering is
/// lexicographic on (height, sequence); zero marks "no transaction found".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub height: u32,
    pub sequence: u32,
}

impl Timestamp {
    #[must_use]
    pub fn new(height: u32, sequence: u32) -> Self {
        Self { height, sequence }
    }

    #[must_use]
    pub fn pack(self) -> u64 {
        (u64::from(self.height) << 32) | u64::from(self.sequence)
    }

    #[must_use]
    pub fn unpack(value: u64) -> Self {
        Self {
            height: (value >> 32) as u32,
            sequence: value as u32,
        }
    }
}

/// A deployed AT: address, creator, creation height and the opaque state
/// blob its machine is reconstituted from each round. Balance is carried on
/// the AT's account, not here.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct AtData {
    pub address: Address,
    pub creator_public_key: PublicKey,
    pub creation_height: u32,
    pub state: Vec<u8>,
}

impl AtData {
    /// Builds the record for a freshly deployed AT. The address is a pure
    /// function of (creator, creation reference).
    #[must_use]
    pub fn deploy(
        creator_public_key: PublicKey,
        creation_reference: &[u8],
        creation_height: u32,
        machine: &MachineState,
    ) -> Self {
        Self {
            address: Address::from_at_creation(&creator_public_key, creation_reference),
            creator_public_key,
            creation_height,
            state: machine.serialize(),
        }
    }
}

/// Outcome of one AT's round: the updated record, the transactions it
/// emitted (empty on failed rounds) and the fees to debit. The caller
/// applies all of it atomically with block application.
#[derive(Clone, Debug)]
pub struct AtRoundResult {
    pub at: AtData,
    pub transactions: Vec<TransactionData>,
    pub fees: Money,
}

/// Runs every eligible AT for the block at `block_height`, in canonical
/// order (ascending AT address). Rounds are independent; each reconstitutes
/// its machine from the persisted blob and re-serialises it afterwards.
pub fn process_block_ats<R: Repository>(
    repository: &R,
    settings: &AtSettings,
    block_height: u32,
) -> Result<Vec<AtRoundResult>, RepositoryErr> {
    let block_tx_count = repository.transactions_in_block(block_height)?.len() as u32;
    let mut emission_base = block_tx_count;
    let mut results = Vec::new();

    for at in repository.active_ats()? {
        let mut machine =
            MachineState::deserialize(&at.state).map_err(|_| RepositoryErr::CorruptData)?;

        if machine.is_stopped() || machine.is_finished() || machine.is_frozen() || machine.is_fatal()
        {
            continue;
        }

        if machine.is_sleeping() {
            if machine.sleep_until_height() > block_height {
                continue;
            }
            machine.wake();
        } else {
            // Scratch registers only survive across a sleep; every other
            // round starts with A and B cleared
            machine.zero_a();
            machine.zero_b();
        }

        // Reflect funds received since the previous round in the balance
        // the VM can observe
        let balance = repository.account_balance(&at.address)?;
        machine.set_current_balance(balance);
        machine.reset_steps();

        let mut api = QuartzAtApi::new(repository, &at, settings, block_height, emission_base);
        machine.run(&mut api, settings);

        if let Some(err) = api.take_repository_error() {
            // Ledger reads failed mid-round: the whole block application
            // must be rejected
            return Err(err);
        }

        let fees = settings.fee_per_step * Money::from(machine.steps());

        let result = if machine.is_fatal() {
            // Failed round: discard emissions, debit full fees if possible
            let debited = fees.min(balance);
            machine.set_previous_balance(balance - debited);
            debug!(
                "AT {} failed its round, debiting {} in fees",
                at.address, debited
            );

            AtRoundResult {
                at: AtData {
                    state: machine.serialize(),
                    ..at.clone()
                },
                transactions: Vec::new(),
                fees: debited,
            }
        } else if fees > balance {
            // Cannot cover its own execution: freeze without emissions
            machine.set_frozen(true);
            machine.set_previous_balance(balance);
            debug!("AT {} frozen: balance {} below fees {}", at.address, balance, fees);

            AtRoundResult {
                at: AtData {
                    state: machine.serialize(),
                    ..at.clone()
                },
                transactions: Vec::new(),
                fees: 0,
            }
        } else {
            if machine.is_stopped() || machine.is_finished() {
                let remaining = balance
                    .saturating_sub(fees)
                    .saturating_sub(api.amount_spent());
                if remaining > 0 {
                    api.on_finished(remaining, &mut machine);
                }
                machine.set_previous_balance(0);
            } else {
                machine.set_previous_balance(
                    balance
                        .saturating_sub(fees)
                        .saturating_sub(api.amount_spent()),
                );
            }

            let transactions = api.into_transactions();
            emission_base += transactions.len() as u32;

            AtRoundResult {
                at: AtData {
                    state: machine.serialize(),
                    ..at.clone()
                },
                transactions,
                fees,
            }
        };

        results.push(result);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_packing_orders_lexicographically() {
        let earlier = Timestamp::new(10, 3);
        let later_same_block = Timestamp::new(10, 4);
        let later_block = Timestamp::new(11, 0);

        assert!(earlier.pack() < later_same_block.pack());
        assert!(later_same_block.pack() < later_block.pack());
        assert_eq!(Timestamp::unpack(earlier.pack()), earlier);
        assert_eq!(Timestamp::unpack(0), Timestamp::new(0, 0));
    }
}
