// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::at::machine::{ExecutionErr, MachineState, PlatformApi};
use crate::at::{AtData, Timestamp};
use crate::chain::{Repository, RepositoryErr};
use crate::consensus::{AtSettings, Money, SYSTEM_PUBLIC_KEY};
use crate::primitives::hash::{sha192, sha256};
use crate::primitives::{
    Address, BaseTransactionData, PublicKey, Signature, TransactionData, NO_GROUP,
};
use log::error;

/// Transaction type values as the VM sees them.
const AT_TX_TYPE_PAYMENT: u64 = 0;
const AT_TX_TYPE_MESSAGE: u64 = 1;

/// All-ones sentinel returned for values the VM cannot resolve.
const SENTINEL: u64 = u64::MAX;

/// Chain-backed implementation of the VM's callback surface, scoped to one
/// AT's round within one block. Collects emitted transactions; the runner
/// appends them to the block after the round succeeds.
///
/// No failure unwinds into the VM: repository errors are recorded on the
/// side (they reject the whole block), everything else degrades to the
/// fatal flag or a sentinel value.
pub struct QuartzAtApi<'a, R: Repository> {
    repository: &'a R,
    at: &'a AtData,
    settings: &'a AtSettings,
    block_height: u32,
    emission_base: u32,
    transactions: Vec<TransactionData>,
    amount_spent: Money,
    repository_error: Option<RepositoryErr>,
}

impl<'a, R: Repository> QuartzAtApi<'a, R> {
    #[must_use]
    pub fn new(
        repository: &'a R,
        at: &'a AtData,
        settings: &'a AtSettings,
        block_height: u32,
        emission_base: u32,
    ) -> Self {
        Self {
            repository,
            at,
            settings,
            block_height,
            emission_base,
            transactions: Vec::new(),
            amount_spent: 0,
            repository_error: None,
        }
    }

    /// Total amount committed to payments this round, refund excluded.
    #[must_use]
    pub fn amount_spent(&self) -> Money {
        self.amount_spent
    }

    /// The round's emissions, in emission order.
    #[must_use]
    pub fn into_transactions(self) -> Vec<TransactionData> {
        self.transactions
    }

    /// A repository failure recorded during the round, if any. Fatal for
    /// the whole block application.
    pub fn take_repository_error(&mut self) -> Option<RepositoryErr> {
        self.repository_error.take()
    }

    fn fail_repository(&mut self, err: RepositoryErr, state: &mut MachineState) {
        error!("AT {}: repository failure during round: {:?}", self.at.address, err);
        self.repository_error = Some(err);
        state.set_fatal();
    }

    /// Fetches the transaction addressed by A1 and re-verifies that its
    /// signature still fingerprints to A2..A4. A mismatch fails the round.
    fn transaction_from_a(&mut self, state: &mut MachineState) -> Option<TransactionData> {
        let ts = Timestamp::unpack(state.a1());

        let tx = match self.repository.transaction_at(ts.height, ts.sequence) {
            Ok(tx) => tx,
            Err(err) => {
                self.fail_repository(err, state);
                return None;
            }
        };

        let Some(tx) = tx else {
            state.set_fatal();
            return None;
        };

        let Some(signature) = tx.signature() else {
            state.set_fatal();
            return None;
        };

        let hash = sha192(signature.as_bytes());
        if state.a2() != crate::codec::u64_from_le(&hash, 0)
            || state.a3() != crate::codec::u64_from_le(&hash, 8)
            || state.a4() != crate::codec::u64_from_le(&hash, 16)
        {
            error!(
                "AT {}: transaction signature in A no longer matches repository",
                self.at.address
            );
            state.set_fatal();
            return None;
        }

        Some(tx)
    }

    /// Timestamp for the next emitted transaction: strictly increasing in
    /// emission order, derived from the block height and the number of
    /// transactions ahead of it in the block. No wall clock involved.
    fn next_transaction_timestamp(&self) -> u64 {
        Timestamp::new(
            self.block_height,
            self.emission_base + self.transactions.len() as u32,
        )
        .pack()
    }

    /// Reference for the next emitted transaction: the signature of the
    /// previous transaction emitted this round, or the AT account's
    /// on-chain last reference if none yet.
    fn last_reference(&mut self, state: &mut MachineState) -> Signature {
        if let Some(last) = self.transactions.last() {
            if let Some(signature) = last.signature() {
                return *signature;
            }
        }

        match self.repository.account_last_reference(&self.at.address) {
            Ok(Some(reference)) => reference,
            Ok(None) => Signature::zero(),
            Err(err) => {
                self.fail_repository(err, state);
                Signature::zero()
            }
        }
    }

    /// Decodes the account implied by B. If B starts with `Q` and the
    /// prefix up to the first NUL parses as a valid native address, B is an
    /// address; otherwise B is a 32-byte public key.
    fn account_from_b(state: &MachineState) -> Address {
        let bytes = state.b_bytes();

        if bytes[0] == b'Q' {
            if let Some(zero_index) = bytes.iter().position(|&b| b == 0) {
                if zero_index > 0 {
                    if let Ok(prefix) = std::str::from_utf8(&bytes[..zero_index]) {
                        if let Ok(address) = Address::from_string(prefix) {
                            return address;
                        }
                    }
                }
            }
        }

        PublicKey(bytes).to_address()
    }

    fn emit(&mut self, recipient: Address, amount: Option<Money>, message: Vec<u8>, state: &mut MachineState) {
        let timestamp = self.next_transaction_timestamp();
        let reference = self.last_reference(state);

        let mut tx = TransactionData::At {
            base: BaseTransactionData {
                timestamp,
                group_id: NO_GROUP,
                reference,
                creator_public_key: PublicKey(SYSTEM_PUBLIC_KEY),
                fee: 0,
                signature: None,
            },
            at_address: self.at.address.clone(),
            recipient,
            amount,
            message,
        };
        tx.at_sign();

        if let Some(amount) = amount {
            self.amount_spent += amount;
        }

        self.transactions.push(tx);
    }
}

impl<'a, R: Repository> PlatformApi for QuartzAtApi<'a, R> {
    fn current_block_height(&mut self) -> u32 {
        self.block_height
    }

    fn at_creation_block_height(&mut self, state: &mut MachineState) -> u32 {
        match self.repository.at_creation_height(&self.at.address) {
            Ok(height) => height,
            Err(err) => {
                self.fail_repository(err, state);
                0
            }
        }
    }

    fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState) {
        let previous_height = self.block_height.saturating_sub(1);

        let summaries = match self.repository.block_summaries(previous_height, previous_height) {
            Ok(summaries) => summaries,
            Err(err) => {
                self.fail_repository(err, state);
                return;
            }
        };

        let Some(summary) = summaries.first() else {
            self.fail_repository(RepositoryErr::NotFound, state);
            return;
        };

        // The signature is longer than A, so store the height and a
        // SHA-192 fingerprint that can be re-verified against a later
        // block lookup
        state.set_a1(u64::from(previous_height));

        let hash = sha192(&summary.signature);
        state.set_a2(crate::codec::u64_from_le(&hash, 0));
        state.set_a3(crate::codec::u64_from_le(&hash, 8));
        state.set_a4(crate::codec::u64_from_le(&hash, 16));
    }

    fn put_transaction_after_timestamp_into_a(&mut self, ts: Timestamp, state: &mut MachineState) {
        let recipient = self.at.address.clone();

        let mut height = ts.height;
        let mut sequence = ts.sequence + 1;

        let current_height = match self.repository.blockchain_height() {
            Ok(height) => height,
            Err(err) => {
                self.fail_repository(err, state);
                return;
            }
        };

        while height <= current_height {
            let transactions = match self.repository.transactions_in_block(height) {
                Ok(transactions) => transactions,
                Err(err) => {
                    self.fail_repository(err, state);
                    return;
                }
            };

            // No more transactions in this block? Try the next one
            if sequence as usize >= transactions.len() {
                height += 1;
                sequence = 0;
                continue;
            }

            let tx = &transactions[sequence as usize];

            if tx.recipient_accounts().contains(&&recipient) {
                let Some(signature) = tx.signature() else {
                    state.set_fatal();
                    return;
                };

                state.set_a1(Timestamp::new(height, sequence).pack());

                // Fingerprint the signature into A2..A4 so later getters
                // can verify it is still the same transaction
                let hash = sha192(signature.as_bytes());
                state.set_a2(crate::codec::u64_from_le(&hash, 0));
                state.set_a3(crate::codec::u64_from_le(&hash, 8));
                state.set_a4(crate::codec::u64_from_le(&hash, 16));

                return;
            }

            sequence += 1;
        }

        // No more transactions
        state.zero_a();
    }

    fn type_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        let Some(tx) = self.transaction_from_a(state) else {
            return SENTINEL;
        };

        match tx {
            TransactionData::Payment { .. } => AT_TX_TYPE_PAYMENT,
            TransactionData::Message { .. } => AT_TX_TYPE_MESSAGE,
            TransactionData::At { amount, .. } => {
                if amount.is_some() {
                    AT_TX_TYPE_PAYMENT
                } else {
                    AT_TX_TYPE_MESSAGE
                }
            }
        }
    }

    fn amount_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        let Some(tx) = self.transaction_from_a(state) else {
            return SENTINEL;
        };

        match tx {
            TransactionData::Payment { amount, .. } => amount,
            TransactionData::At {
                amount: Some(amount),
                ..
            } => amount,
            _ => SENTINEL,
        }
    }

    fn timestamp_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        if self.transaction_from_a(state).is_none() {
            return SENTINEL;
        }

        // The transaction's timestamp is the packed value already in A1
        state.a1()
    }

    fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        if !state.is_first_op_after_sleeping() {
            // First call: sleep for a block so the value derives from a
            // block signature the caller could not predict
            let wake = self.block_height + 1;
            state.sleep_until(wake);
            return 0;
        }

        // Second call, one block later
        let Some(tx) = self.transaction_from_a(state) else {
            return 0;
        };

        let Some(signature) = tx.signature() else {
            state.set_fatal();
            return 0;
        };

        let block = match self.repository.last_block() {
            Ok(block) => block,
            Err(err) => {
                self.fail_repository(err, state);
                return 0;
            }
        };

        let mut input = Vec::with_capacity(signature.as_bytes().len() + block.signature.len());
        input.extend_from_slice(signature.as_bytes());
        input.extend_from_slice(&block.signature);

        crate::codec::u64_from_le(&sha256(&input), 0)
    }

    fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
        // Zero B up front so failure modes and short messages leave a
        // well-defined register
        state.zero_b();

        let Some(tx) = self.transaction_from_a(state) else {
            return;
        };

        let message = match tx {
            TransactionData::Message { data, .. } => data,
            TransactionData::At { message, .. } => message,
            _ => return,
        };

        if message.len() > 32 {
            return;
        }

        // Pad to fit B. Byte order is preserved so a hash carried in the
        // message compares lane-for-lane with one computed locally
        let mut padded = [0u8; 32];
        padded[..message.len()].copy_from_slice(&message);
        state.set_b_bytes(&padded);
    }

    fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
        let Some(tx) = self.transaction_from_a(state) else {
            return;
        };

        // The public key subsumes an address and permits later signature
        // verification
        let bytes = *tx.base().creator_public_key.as_bytes();
        state.set_b_bytes(&bytes);
    }

    fn put_creator_address_into_b(&mut self, state: &mut MachineState) {
        let bytes = *self.at.creator_public_key.as_bytes();
        state.set_b_bytes(&bytes);
    }

    fn current_balance(&mut self, state: &mut MachineState) -> u64 {
        state.current_balance()
    }

    fn previous_balance(&mut self, state: &mut MachineState) -> u64 {
        state.previous_balance()
    }

    fn pay_amount_to_b(&mut self, amount: u64, state: &mut MachineState) {
        let recipient = Self::account_from_b(state);
        self.emit(recipient, Some(amount), Vec::new(), state);
    }

    fn message_a_to_b(&mut self, state: &mut MachineState) {
        let message = state.a_bytes().to_vec();
        let recipient = Self::account_from_b(state);
        self.emit(recipient, None, message, state);
    }

    fn add_minutes_to_timestamp(&mut self, ts: Timestamp, minutes: u64) -> u64 {
        // At least one block in the future
        let blocks = (minutes / u64::from(self.settings.minutes_per_block)).max(1);
        Timestamp::new(ts.height + blocks as u32, 0).pack()
    }

    fn on_finished(&mut self, balance: u64, state: &mut MachineState) {
        // Refund the remaining balance to the AT's creator
        let creator = self.at.creator_public_key.to_address();
        self.emit(creator, Some(balance), Vec::new(), state);
    }

    fn on_fatal_error(&mut self, _state: &MachineState, err: ExecutionErr) {
        error!("AT {} suffered fatal error: {:?}", self.at.address, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::machine::{platform_fun, OpCode};
    use crate::at::{process_block_ats, MachineState};
    use crate::chain::MemoryRepository;
    use crate::primitives::{public_key_of, BlockData};

    const FUN_SET_B1: u16 = 0x0116;

    fn at_settings() -> AtSettings {
        AtSettings {
            fee_per_step: 1,
            ..AtSettings::default()
        }
    }

    fn block(height: u32) -> BlockData {
        BlockData {
            height,
            signature: vec![height as u8 ^ 0x5a; 64],
            timestamp: 1_600_000_000 + i64::from(height),
        }
    }

    fn message_to(recipient: &Address, secret: &[u8; 32], data: Vec<u8>) -> TransactionData {
        let mut tx = TransactionData::Message {
            base: BaseTransactionData {
                timestamp: 999,
                group_id: NO_GROUP,
                reference: Signature::zero(),
                creator_public_key: public_key_of(secret),
                fee: 1,
                signature: None,
            },
            recipient: recipient.clone(),
            data,
        };
        tx.sign(secret);
        tx
    }

    /// Repository with blocks 1..=height, the given AT deployed at block 1.
    fn fixture(height: u32, machine: &MachineState) -> (MemoryRepository, AtData) {
        let repository = MemoryRepository::new();
        for h in 1..=height {
            repository.push_block(block(h), vec![]);
        }

        let at = AtData::deploy(PublicKey([3; 32]), &[7; 64], 1, machine);
        repository.deploy_at(at.clone(), 1);
        (repository, at)
    }

    fn scratch_machine() -> MachineState {
        // Machine bytecode is irrelevant for direct API tests
        MachineState::new(vec![OpCode::FinImd as u8], 64).unwrap()
    }

    #[test]
    fn scan_finds_message_and_copies_payload_into_b() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(9, &machine);

        let payload: Vec<u8> = (1..=16).collect();
        let tx = message_to(&at.address, &[9; 32], payload.clone());
        let expected_sig = *tx.signature().unwrap();

        repository.push_block(block(10), vec![
            message_to(&Address::random(), &[8; 32], vec![0xff]),
            message_to(&Address::random(), &[8; 32], vec![0xfe]),
            message_to(&Address::random(), &[8; 32], vec![0xfd]),
            tx,
        ]);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 0);

        api.put_transaction_after_timestamp_into_a(Timestamp::new(9, 0), &mut machine);

        assert_eq!(machine.a1(), Timestamp::new(10, 3).pack());
        let hash = sha192(expected_sig.as_bytes());
        assert_eq!(machine.a2(), crate::codec::u64_from_le(&hash, 0));
        assert_eq!(machine.a3(), crate::codec::u64_from_le(&hash, 8));
        assert_eq!(machine.a4(), crate::codec::u64_from_le(&hash, 16));

        assert_eq!(api.type_from_transaction_in_a(&mut machine), AT_TX_TYPE_MESSAGE);

        api.put_message_from_transaction_in_a_into_b(&mut machine);
        let mut expected = [0u8; 32];
        expected[..16].copy_from_slice(&payload);
        assert_eq!(machine.b_bytes(), expected);
        assert!(!machine.is_fatal());
    }

    #[test]
    fn scan_at_tip_with_no_match_zeroes_a() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(10, &machine);

        machine.set_a1(0xdead);
        machine.set_a2(0xbeef);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 0);
        api.put_transaction_after_timestamp_into_a(Timestamp::new(10, 0), &mut machine);

        assert_eq!(machine.a1(), 0);
        assert_eq!(machine.a2(), 0);
        assert_eq!(machine.a3(), 0);
        assert_eq!(machine.a4(), 0);
    }

    #[test]
    fn oversized_message_leaves_b_zero() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(9, &machine);

        let tx = message_to(&at.address, &[9; 32], vec![0xaa; 33]);
        repository.push_block(block(10), vec![tx]);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 0);

        api.put_transaction_after_timestamp_into_a(Timestamp::new(9, 0), &mut machine);
        machine.set_b_bytes(&[0x77; 32]);
        api.put_message_from_transaction_in_a_into_b(&mut machine);

        assert_eq!(machine.b_bytes(), [0u8; 32]);
    }

    #[test]
    fn fingerprint_mismatch_fails_the_round() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(9, &machine);

        let tx = message_to(&at.address, &[9; 32], vec![1, 2, 3]);
        repository.push_block(block(10), vec![tx]);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 0);

        api.put_transaction_after_timestamp_into_a(Timestamp::new(9, 0), &mut machine);
        // Corrupt one fingerprint lane
        machine.set_a3(machine.a3() ^ 1);

        assert_eq!(api.type_from_transaction_in_a(&mut machine), SENTINEL);
        assert!(machine.is_fatal());
    }

    #[test]
    fn previous_block_hash_lands_in_a() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(10, &machine);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 0);
        api.put_previous_block_hash_into_a(&mut machine);

        assert_eq!(machine.a1(), 9);
        let hash = sha192(&block(9).signature);
        assert_eq!(machine.a2(), crate::codec::u64_from_le(&hash, 0));
        assert_eq!(machine.a4(), crate::codec::u64_from_le(&hash, 16));
    }

    #[test]
    fn random_is_two_phase_and_deterministic() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(9, &machine);

        let tx = message_to(&at.address, &[9; 32], vec![5]);
        let tx_sig = *tx.signature().unwrap();
        repository.push_block(block(10), vec![tx]);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 0);
        api.put_transaction_after_timestamp_into_a(Timestamp::new(9, 0), &mut machine);

        // First call: sleeps and returns zero
        assert_eq!(api.generate_random_using_transaction_in_a(&mut machine), 0);
        assert!(machine.is_sleeping());
        assert_eq!(machine.sleep_until_height(), 11);

        // A block arrives while the AT sleeps
        repository.push_block(block(11), vec![]);
        machine.wake();

        let mut api = QuartzAtApi::new(&repository, &at, &settings, 11, 0);
        let value = api.generate_random_using_transaction_in_a(&mut machine);

        let mut input = Vec::new();
        input.extend_from_slice(tx_sig.as_bytes());
        input.extend_from_slice(&block(11).signature);
        assert_eq!(value, crate::codec::u64_from_le(&sha256(&input), 0));
        assert!(!machine.is_fatal());
    }

    #[test]
    fn account_from_b_decoding_routes() {
        let mut machine = scratch_machine();

        // 'Q' + valid address + NUL: address route
        let address = PublicKey([6; 32]).to_address();
        let mut b = [0u8; 32];
        b[..address.as_str().len()].copy_from_slice(address.as_str().as_bytes());
        machine.set_b_bytes(&b);
        assert_eq!(
            QuartzAtApi::<MemoryRepository>::account_from_b(&machine),
            address
        );

        // 'Q' + invalid address: public-key route
        let mut b = [0u8; 32];
        b[0] = b'Q';
        b[1] = b'x';
        machine.set_b_bytes(&b);
        assert_eq!(
            QuartzAtApi::<MemoryRepository>::account_from_b(&machine),
            PublicKey(b).to_address()
        );

        // No leading 'Q': public-key route
        let b = [0x0fu8; 32];
        machine.set_b_bytes(&b);
        assert_eq!(
            QuartzAtApi::<MemoryRepository>::account_from_b(&machine),
            PublicKey(b).to_address()
        );
    }

    #[test]
    fn emissions_chain_references_and_increase_timestamps() {
        let mut machine = scratch_machine();
        let (repository, at) = fixture(10, &machine);

        let pre_round_reference = Signature([0x42; 64]);
        repository.set_account_last_reference(&at.address, pre_round_reference);

        let settings = at_settings();
        let mut api = QuartzAtApi::new(&repository, &at, &settings, 10, 2);

        machine.set_b_bytes(&[0x21; 32]);
        api.pay_amount_to_b(4, &mut machine);
        api.pay_amount_to_b(5, &mut machine);
        api.message_a_to_b(&mut machine);

        let transactions = api.into_transactions();
        assert_eq!(transactions.len(), 3);

        // First reference is the AT account's pre-round last reference
        assert_eq!(transactions[0].base().reference, pre_round_reference);

        for i in 1..transactions.len() {
            assert_eq!(
                &transactions[i].base().reference,
                transactions[i - 1].signature().unwrap()
            );
            assert!(transactions[i].base().timestamp > transactions[i - 1].base().timestamp);
        }

        assert_eq!(
            transactions[0].base().timestamp,
            Timestamp::new(10, 2).pack()
        );
    }

    /// Full runner round: load a recipient public key into B through
    /// bytecode, pay it, then sleep.
    #[test]
    fn runner_collects_payment_emission() {
        let recipient_pk = PublicKey([0xd1; 32]);
        let lanes: Vec<u64> = (0..4)
            .map(|i| crate::codec::u64_from_le(recipient_pk.as_bytes(), i * 8))
            .collect();

        let mut code = Vec::new();
        // data[0..4] = recipient public key lanes; data[4] = amount
        for (i, lane) in lanes.iter().enumerate() {
            code.push(OpCode::SetVal as u8);
            code.extend_from_slice(&(i as u32).to_le_bytes());
            code.extend_from_slice(&lane.to_le_bytes());
        }
        code.push(OpCode::SetVal as u8);
        code.extend_from_slice(&4u32.to_le_bytes());
        code.extend_from_slice(&4u64.to_le_bytes());
        // SET_B1..B4 from data[0..4]
        for i in 0..4u32 {
            code.push(OpCode::ExtFunDat as u8);
            code.extend_from_slice(&(FUN_SET_B1 + i as u16).to_le_bytes());
            code.extend_from_slice(&i.to_le_bytes());
        }
        // SEND_TO_ADDRESS_IN_B data[4]
        code.push(OpCode::ExtFunDat as u8);
        code.extend_from_slice(&platform_fun::SEND_TO_ADDRESS_IN_B.to_le_bytes());
        code.extend_from_slice(&4u32.to_le_bytes());
        // Sleep: round over, not terminal
        code.push(OpCode::SlpImd as u8);

        let machine = MachineState::new(code, 64).unwrap();
        let (repository, at) = fixture(10, &machine);

        let pre_round_reference = Signature([0x61; 64]);
        repository.set_account_last_reference(&at.address, pre_round_reference);
        repository.set_account_balance(&at.address, 10 * crate::consensus::COIN);

        let results = process_block_ats(&repository, &at_settings(), 10).unwrap();
        assert_eq!(results.len(), 1);

        let round = &results[0];
        assert_eq!(round.transactions.len(), 1);

        match &round.transactions[0] {
            TransactionData::At {
                base,
                recipient,
                amount,
                ..
            } => {
                assert_eq!(*amount, Some(4));
                assert_eq!(recipient, &recipient_pk.to_address());
                assert_eq!(base.reference, pre_round_reference);
            }
            other => panic!("expected AT transaction, got {other:?}"),
        }

        // The persisted machine is sleeping until the next block
        let persisted = MachineState::deserialize(&round.at.state).unwrap();
        assert!(persisted.is_sleeping());
        assert_eq!(persisted.sleep_until_height(), 11);
    }

    #[test]
    fn runner_debits_full_fees_on_step_overrun() {
        // Infinite loop
        let mut code = vec![OpCode::JmpAdr as u8];
        code.extend_from_slice(&0u32.to_le_bytes());

        let machine = MachineState::new(code, 8).unwrap();
        let (repository, at) = fixture(10, &machine);
        repository.set_account_balance(&at.address, 1_000_000);

        let settings = AtSettings {
            fee_per_step: 73,
            max_steps_per_round: 100,
            ..AtSettings::default()
        };

        let results = process_block_ats(&repository, &settings, 10).unwrap();
        assert_eq!(results.len(), 1);

        let round = &results[0];
        assert!(round.transactions.is_empty());
        assert_eq!(round.fees, 73 * 100);

        let persisted = MachineState::deserialize(&round.at.state).unwrap();
        assert!(persisted.is_fatal());
    }

    #[test]
    fn runner_freezes_at_that_cannot_pay_fees() {
        let machine = scratch_machine();
        let (repository, at) = fixture(10, &machine);
        repository.set_account_balance(&at.address, 0);

        let settings = AtSettings {
            fee_per_step: 73,
            ..AtSettings::default()
        };

        let results = process_block_ats(&repository, &settings, 10).unwrap();
        let round = &results[0];

        assert!(round.transactions.is_empty());
        assert_eq!(round.fees, 0);

        let persisted = MachineState::deserialize(&round.at.state).unwrap();
        assert!(persisted.is_frozen());
    }

    #[test]
    fn runner_refunds_creator_on_finish() {
        // FIN immediately
        let machine = MachineState::new(vec![OpCode::FinImd as u8], 8).unwrap();
        let (repository, at) = fixture(10, &machine);
        repository.set_account_balance(&at.address, 1_000);

        let settings = AtSettings {
            fee_per_step: 1,
            ..AtSettings::default()
        };

        let results = process_block_ats(&repository, &settings, 10).unwrap();
        let round = &results[0];

        // One step consumed, the rest refunded to the creator
        assert_eq!(round.fees, 1);
        assert_eq!(round.transactions.len(), 1);
        match &round.transactions[0] {
            TransactionData::At {
                recipient, amount, ..
            } => {
                assert_eq!(recipient, &at.creator_public_key.to_address());
                assert_eq!(*amount, Some(999));
            }
            other => panic!("expected AT refund, got {other:?}"),
        }

        let persisted = MachineState::deserialize(&round.at.state).unwrap();
        assert!(persisted.is_finished());
        assert_eq!(persisted.previous_balance(), 0);
    }

    #[test]
    fn runner_skips_sleeping_at_until_wake_height() {
        let mut machine = scratch_machine();
        machine.sleep_until(12);

        let (repository, at) = fixture(10, &machine);
        repository.set_account_balance(&at.address, 1_000);

        let results = process_block_ats(&repository, &at_settings(), 10).unwrap();
        assert!(results.is_empty());

        // At its wake height the AT runs again
        repository.push_block(block(11), vec![]);
        repository.push_block(block(12), vec![]);
        let results = process_block_ats(&repository, &at_settings(), 12).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].at.address, at.address);
    }
}
