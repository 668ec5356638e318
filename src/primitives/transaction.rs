// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::Money;
use crate::primitives::hash::sha256;
use crate::primitives::{sign_message, Address, PublicKey, Signature};
use bincode::{Decode, Encode};

/// Group id carried by transactions outside any group.
pub const NO_GROUP: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionType {
    Payment,
    Message,
    At,
}

impl TransactionType {
    /// Consensus-stable numeric transaction type.
    #[must_use]
    pub fn value(self) -> u16 {
        match self {
            TransactionType::Payment => 2,
            TransactionType::At => 16,
            TransactionType::Message => 17,
        }
    }
}

/// Fields shared by every transaction kind.
///
/// `reference` is the signature of the previous transaction by the same
/// creator; it chains an account's transactions into a verifiable sequence.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BaseTransactionData {
    pub timestamp: u64,
    pub group_id: u32,
    pub reference: Signature,
    pub creator_public_key: PublicKey,
    pub fee: Money,
    pub signature: Option<Signature>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum TransactionData {
    Payment {
        base: BaseTransactionData,
        recipient: Address,
        amount: Money,
    },
    Message {
        base: BaseTransactionData,
        recipient: Address,
        data: Vec<u8>,
    },
    /// Emitted by a running AT. `amount == None` makes it message-like,
    /// `amount == Some(_)` payment-like.
    At {
        base: BaseTransactionData,
        at_address: Address,
        recipient: Address,
        amount: Option<Money>,
        message: Vec<u8>,
    },
}

impl TransactionData {
    #[must_use]
    pub fn base(&self) -> &BaseTransactionData {
        match self {
            TransactionData::Payment { base, .. }
            | TransactionData::Message { base, .. }
            | TransactionData::At { base, .. } => base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseTransactionData {
        match self {
            TransactionData::Payment { base, .. }
            | TransactionData::Message { base, .. }
            | TransactionData::At { base, .. } => base,
        }
    }

    #[must_use]
    pub fn tx_type(&self) -> TransactionType {
        match self {
            TransactionData::Payment { .. } => TransactionType::Payment,
            TransactionData::Message { .. } => TransactionType::Message,
            TransactionData::At { .. } => TransactionType::At,
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&Signature> {
        self.base().signature.as_ref()
    }

    /// Accounts that receive this transaction. Used by the VM's forward
    /// chain scan to find transactions addressed to an AT.
    #[must_use]
    pub fn recipient_accounts(&self) -> Vec<&Address> {
        match self {
            TransactionData::Payment { recipient, .. }
            | TransactionData::Message { recipient, .. }
            | TransactionData::At { recipient, .. } => vec![recipient],
        }
    }

    /// Canonical byte payload covered by the signature. Hand-packed
    /// little-endian so that AT-emitted transactions serialise identically
    /// to hand-built ones and join the same signature/reference chain.
    #[must_use]
    pub fn to_signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        let base = self.base();

        out.extend_from_slice(&self.tx_type().value().to_le_bytes());
        out.extend_from_slice(&base.timestamp.to_le_bytes());
        out.extend_from_slice(&base.group_id.to_le_bytes());
        out.extend_from_slice(base.reference.as_bytes());
        out.extend_from_slice(base.creator_public_key.as_bytes());
        out.extend_from_slice(&base.fee.to_le_bytes());

        match self {
            TransactionData::Payment { recipient, amount, .. } => {
                push_address(&mut out, recipient);
                out.extend_from_slice(&amount.to_le_bytes());
            }

            TransactionData::Message { recipient, data, .. } => {
                push_address(&mut out, recipient);
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }

            TransactionData::At {
                at_address,
                recipient,
                amount,
                message,
                ..
            } => {
                push_address(&mut out, at_address);
                push_address(&mut out, recipient);
                match amount {
                    Some(amount) => {
                        out.push(1);
                        out.extend_from_slice(&amount.to_le_bytes());
                    }
                    None => out.push(0),
                }
                out.extend_from_slice(&(message.len() as u32).to_le_bytes());
                out.extend_from_slice(message);
            }
        }

        out
    }

    /// Signs with the creator's ed25519 secret key.
    pub fn sign(&mut self, secret: &[u8; 32]) {
        let payload = self.to_signing_payload();
        let signature = sign_message(secret, &payload);
        self.base_mut().signature = Some(signature);
    }

    /// Deterministic signature for AT-emitted transactions. ATs own no
    /// private key, so the signature is derived from the payload and the
    /// AT creator's public key instead:
    /// `sha256(payload) ‖ sha256(payload ‖ creatorPublicKey)`.
    pub fn at_sign(&mut self) {
        let payload = self.to_signing_payload();
        let creator = *self.base().creator_public_key.as_bytes();

        let mut keyed = payload.clone();
        keyed.extend_from_slice(&creator);

        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(&sha256(&payload));
        sig[32..].copy_from_slice(&sha256(&keyed));

        self.base_mut().signature = Some(Signature(sig));
    }

    #[must_use]
    pub fn verify_signature(&self) -> bool {
        let Some(signature) = self.base().signature.as_ref() else {
            return false;
        };

        self.base()
            .creator_public_key
            .verify(&self.to_signing_payload(), signature)
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).unwrap()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        crate::codec::decode(bytes)
    }
}

fn push_address(out: &mut Vec<u8>, address: &Address) {
    let bytes = address.as_str().as_bytes();
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}
