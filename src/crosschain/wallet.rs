// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crosschain::provider::{BlockchainProvider, ForeignBlockchainErr};
use crate::crosschain::{Bitcoiny, ForeignBlockchain};
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, EcdsaSighashType, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use log::debug;

/// How many fresh leaf keys each widening of the search window adds.
pub const LOOKAHEAD_INCREMENT: usize = 3;

/// Below this, change is burned into fees rather than creating an output.
const DUST_THRESHOLD: u64 = 546;

/// Size estimate for a legacy P2PKH spend: overhead + per-input + per-output.
fn estimated_size(inputs: usize, outputs: usize) -> u64 {
    10 + 148 * inputs as u64 + 34 * outputs as u64
}

/// One leaf of the external receive chain m/0/i.
struct LeafKey {
    index: u32,
    secret: SecretKey,
    public_key: CompressedPublicKey,
    script_pub_key: ScriptBuf,
}

/// An unspent output owned by a wallet leaf key.
#[derive(Clone, Debug)]
pub struct WalletUtxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub height: u32,
    pub script_pub_key: ScriptBuf,
    pub key_index: u32,
}

impl<P: BlockchainProvider> Bitcoiny<P> {
    /// Returns the first never-used receive address of the BIP32 wallet.
    ///
    /// Walks leaf keys m/0/i in order. A key with UTXOs is in use; a key
    /// without UTXOs but with history is fully spent and remembered in
    /// `spent_keys`; the first key with neither is the answer. The search
    /// window starts at [`LOOKAHEAD_INCREMENT`] keys and widens by the same
    /// amount whenever a batch finishes without a hit.
    pub fn unused_receive_address(&self, xprv58: &str) -> Result<String, ForeignBlockchainErr> {
        let secp = Secp256k1::new();
        let master = self.parse_wallet_key(xprv58)?;

        let mut window = LOOKAHEAD_INCREMENT;
        let mut ki = 0usize;

        loop {
            while ki < window {
                let key = self.leaf_key(&secp, &master, 0, ki as u32)?;
                let unspent = self.provider.unspent_outputs(key.script_pub_key.as_bytes())?;

                /*
                 * No unspent outputs means either (a) every output has been
                 * spent, or (b) the address has never been used. For (a) we
                 * remember the key so we never ask for its history again.
                 */
                if unspent.is_empty() {
                    if self.spent_keys.read().contains(&key.public_key.to_bytes()) {
                        ki += 1;
                        continue;
                    }

                    let history = self
                        .provider
                        .address_transactions(key.script_pub_key.as_bytes())?;

                    if history.is_empty() {
                        // Never used
                        return Ok(self.leaf_address(&key).to_string());
                    }

                    // Fully spent
                    self.spent_keys.write().insert(key.public_key.to_bytes());
                    ki += 1;
                    continue;
                }

                // Key holds funds, hence used, so no good to us
                self.spent_keys.write().remove(&key.public_key.to_bytes());
                ki += 1;
            }

            window += LOOKAHEAD_INCREMENT;
        }
    }

    /// Collects every unspent output across the wallet's receive chain,
    /// walking with the same spent-key discipline as
    /// [`Self::unused_receive_address`] and widening the window until a
    /// full batch of keys turns out unspent.
    pub fn open_utxos(&self, xprv58: &str) -> Result<Vec<WalletUtxo>, ForeignBlockchainErr> {
        let secp = Secp256k1::new();
        let master = self.parse_wallet_key(xprv58)?;

        let mut collected = Vec::new();
        let mut window = LOOKAHEAD_INCREMENT;
        let mut ki = 0usize;

        loop {
            let mut all_keys_unspent = true;

            while ki < window {
                let key = self.leaf_key(&secp, &master, 0, ki as u32)?;
                let unspent = self.provider.unspent_outputs(key.script_pub_key.as_bytes())?;

                if unspent.is_empty() {
                    if self.spent_keys.read().contains(&key.public_key.to_bytes()) {
                        all_keys_unspent = false;
                        ki += 1;
                        continue;
                    }

                    let history = self
                        .provider
                        .address_transactions(key.script_pub_key.as_bytes())?;

                    if !history.is_empty() {
                        self.spent_keys.write().insert(key.public_key.to_bytes());
                        all_keys_unspent = false;
                    }

                    ki += 1;
                    continue;
                }

                self.spent_keys.write().remove(&key.public_key.to_bytes());

                for output in unspent {
                    // Resolve value/script from the transaction itself when
                    // the index does not carry them
                    let (value, script_pub_key) = if output.script_pub_key.is_empty() {
                        let outputs = self.outputs(&output.hash)?;
                        let resolved = outputs.get(output.index as usize).ok_or(
                            ForeignBlockchainErr::InvalidResponse("unspent output index out of range"),
                        )?;
                        (resolved.value.to_sat(), resolved.script_pubkey.clone())
                    } else {
                        (output.value, ScriptBuf::from_bytes(output.script_pub_key.clone()))
                    };

                    collected.push(WalletUtxo {
                        outpoint: OutPoint {
                            txid: Txid::from_byte_array(output.hash),
                            vout: output.index,
                        },
                        value,
                        height: output.height,
                        script_pub_key,
                        key_index: key.index,
                    });
                }

                ki += 1;
            }

            if all_keys_unspent {
                return Ok(collected);
            }

            window += LOOKAHEAD_INCREMENT;
        }
    }

    /// Sum of the wallet's unspent outputs.
    pub fn wallet_balance(&self, xprv58: &str) -> Result<u64, ForeignBlockchainErr> {
        Ok(self.open_utxos(xprv58)?.iter().map(|utxo| utxo.value).sum())
    }

    /// Builds a signed legacy P2PKH spend of `amount` to `recipient`.
    ///
    /// `fee_per_byte` of `None` selects the configured per-KB default.
    /// Returns `Ok(None)` when the wallet cannot cover amount plus fees.
    /// This is the only place external-chain signing of wallet keys occurs.
    pub fn build_spend(
        &self,
        xprv58: &str,
        recipient: &str,
        amount: u64,
        fee_per_byte: Option<u64>,
    ) -> Result<Option<Transaction>, ForeignBlockchainErr> {
        let secp = Secp256k1::new();
        let master = self.parse_wallet_key(xprv58)?;
        let destination = self.parse_address(recipient)?;

        let fee_per_kb = match fee_per_byte {
            Some(per_byte) => per_byte * 1000, // Note: 1000 not 1024
            None => self.fee_per_kb(),
        };

        let utxos = self.open_utxos(xprv58)?;

        // Accumulate inputs until they cover amount + fee at the size the
        // selection implies
        let mut selected: Vec<&WalletUtxo> = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;

        for utxo in &utxos {
            selected.push(utxo);
            total += utxo.value;

            fee = estimated_size(selected.len(), 2) * fee_per_kb / 1000;
            if total >= amount + fee {
                break;
            }
        }

        if total < amount + fee {
            return Ok(None);
        }

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: destination.script_pubkey(),
        }];

        // Change returns to the wallet's own change chain m/1/0
        let change = total - amount - fee;
        if change >= DUST_THRESHOLD {
            let change_key = self.leaf_key(&secp, &master, 1, 0)?;
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_key.script_pub_key.clone(),
            });
        }

        let inputs: Vec<TxIn> = selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();

        let mut transaction = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        // Sign each input against the script of the output it spends
        let mut script_sigs = Vec::with_capacity(selected.len());
        {
            let cache = SighashCache::new(&transaction);

            for (i, utxo) in selected.iter().enumerate() {
                let key = self.leaf_key(&secp, &master, 0, utxo.key_index)?;

                let sighash = cache
                    .legacy_signature_hash(
                        i,
                        &utxo.script_pub_key,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .map_err(|_| ForeignBlockchainErr::Error("sighash input index"))?;

                let signature =
                    secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &key.secret);

                let mut signature_bytes = signature.serialize_der().to_vec();
                signature_bytes.push(EcdsaSighashType::All.to_u32() as u8);

                let signature_push = PushBytesBuf::try_from(signature_bytes)
                    .map_err(|_| ForeignBlockchainErr::Error("signature push size"))?;

                script_sigs.push(
                    Builder::new()
                        .push_slice(signature_push)
                        .push_slice(key.public_key.to_bytes())
                        .into_script(),
                );
            }
        }

        for (input, script_sig) in transaction.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }

        debug!(
            "built spend of {} with fee {} over {} inputs",
            amount,
            fee,
            transaction.input.len()
        );

        Ok(Some(transaction))
    }

    fn parse_wallet_key(&self, xprv58: &str) -> Result<Xpriv, ForeignBlockchainErr> {
        let xpriv: Xpriv = xprv58
            .parse()
            .map_err(|_| ForeignBlockchainErr::Error("invalid BIP32 wallet key"))?;

        if xpriv.network != self.network.into() {
            return Err(ForeignBlockchainErr::Error(
                "wallet key is for another network",
            ));
        }

        Ok(xpriv)
    }

    fn leaf_key(
        &self,
        secp: &Secp256k1<All>,
        master: &Xpriv,
        chain: u32,
        index: u32,
    ) -> Result<LeafKey, ForeignBlockchainErr> {
        let path = [
            ChildNumber::from_normal_idx(chain)
                .map_err(|_| ForeignBlockchainErr::Error("derivation index out of range"))?,
            ChildNumber::from_normal_idx(index)
                .map_err(|_| ForeignBlockchainErr::Error("derivation index out of range"))?,
        ];

        let child = master
            .derive_priv(secp, &path)
            .map_err(|_| ForeignBlockchainErr::Error("key derivation failure"))?;

        let private_key = child.to_priv();
        let public_key = CompressedPublicKey::from_private_key(secp, &private_key)
            .map_err(|_| ForeignBlockchainErr::Error("public key derivation failure"))?;

        Ok(LeafKey {
            index,
            secret: private_key.inner,
            public_key,
            script_pub_key: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        })
    }

    fn leaf_address(&self, key: &LeafKey) -> Address {
        Address::p2pkh(key.public_key.pubkey_hash(), self.network)
    }
}
