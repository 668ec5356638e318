// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crosschain::htlc::HtlcScript;
use crate::crosschain::provider::{BlockchainProvider, ForeignBlockchainErr};
use crate::crosschain::Bitcoiny;
use bitcoin::absolute::LockTime;
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, AddressType, Amount, CompressedPublicKey, EcdsaSighashType, OutPoint, PrivateKey,
    Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use log::info;

/// Default miner's fee for HTLC spends, in sats (0.0001 coins).
pub const DEFAULT_SWAP_FEE: u64 = 10_000;

#[derive(Debug)]
pub enum SwapErr {
    /// Malformed key, address or hash. User-facing, local.
    InvalidInput(&'static str),

    /// A cross-party invariant does not hold: derived P2SH mismatch,
    /// refund attempted too early, unexpected UTXO set. Never retried.
    SafetyViolation(String),

    /// External node failure; the flow aborts.
    Foreign(ForeignBlockchainErr),
}

impl From<ForeignBlockchainErr> for SwapErr {
    fn from(other: ForeignBlockchainErr) -> Self {
        Self::Foreign(other)
    }
}

/// Inputs to the refund flow: the initiator recovers funds after timeout.
pub struct RefundRequest {
    pub p2sh_address: String,
    pub refund_secret: [u8; 32],
    pub redeemer_p2pkh: String,
    pub secret_hash: [u8; 20],
    pub lock_time: u32,
    pub fee: u64,
}

/// Inputs to the redeem flow: the responder claims funds with the secret.
pub struct RedeemRequest {
    pub p2sh_address: String,
    pub redeem_secret: [u8; 32],
    pub refunder_p2pkh: String,
    pub secret: Vec<u8>,
    pub lock_time: u32,
    pub fee: u64,
}

/// Trims a 37/38-byte dumped private key (leading version byte, trailing
/// compression flag and/or checksum) down to its 32 key bytes.
pub fn trim_private_key(bytes: &[u8]) -> Result<[u8; 32], SwapErr> {
    let trimmed: &[u8] = if bytes.len() >= 37 && bytes.len() <= 38 {
        &bytes[1..33]
    } else {
        bytes
    };

    <[u8; 32]>::try_from(trimmed).map_err(|_| SwapErr::InvalidInput("private key must be 32 bytes"))
}

/// The single confirmed UTXO funding an HTLC.
#[derive(Clone, Copy, Debug)]
pub struct FundingOutput {
    pub outpoint: OutPoint,
    pub value: u64,
}

/// Validates and executes the refund flow, returning the signed
/// transaction ready for broadcast.
pub fn checked_refund<P: BlockchainProvider>(
    bitcoiny: &Bitcoiny<P>,
    request: &RefundRequest,
    now_secs: u64,
) -> Result<Transaction, SwapErr> {
    let secp = Secp256k1::new();

    let secret_key = SecretKey::from_slice(&request.refund_secret)
        .map_err(|_| SwapErr::InvalidInput("invalid refund private key"))?;
    let refund_pubkey = compressed_pubkey(&secp, secret_key, bitcoiny);

    let p2sh = parse_typed_address(bitcoiny, &request.p2sh_address, AddressType::P2sh, "P2SH")?;
    let redeemer = parse_typed_address(
        bitcoiny,
        &request.redeemer_p2pkh,
        AddressType::P2pkh,
        "redeemer P2PKH",
    )?;

    let htlc = HtlcScript {
        refunder_pkh: refund_pubkey.pubkey_hash().to_byte_array(),
        lock_time: request.lock_time,
        redeemer_pkh: pubkey_hash_of(&redeemer)?,
        secret_hash: request.secret_hash,
    };

    verify_p2sh(bitcoiny, &htlc, &p2sh)?;
    check_refund_timing(bitcoiny, request.lock_time, now_secs)?;

    let funding = single_funding_output(bitcoiny, &p2sh, request.fee)?;
    let refund_amount = funding.value - request.fee;

    info!(
        "refunding {} from {} to {}",
        bitcoiny.format_amount(refund_amount),
        request.p2sh_address,
        bitcoiny.pkh_to_address(htlc.refunder_pkh)
    );

    build_refund_transaction(
        refund_amount,
        secret_key,
        refund_pubkey,
        funding,
        &htlc.redeem_script(),
        request.lock_time,
    )
}

/// Validates and executes the redeem flow. Symmetric to the refund, but
/// keyed by the redeemer, ungated by time, and revealing the secret.
pub fn checked_redeem<P: BlockchainProvider>(
    bitcoiny: &Bitcoiny<P>,
    request: &RedeemRequest,
) -> Result<Transaction, SwapErr> {
    let secp = Secp256k1::new();

    let secret_key = SecretKey::from_slice(&request.redeem_secret)
        .map_err(|_| SwapErr::InvalidInput("invalid redeem private key"))?;
    let redeem_pubkey = compressed_pubkey(&secp, secret_key, bitcoiny);

    let p2sh = parse_typed_address(bitcoiny, &request.p2sh_address, AddressType::P2sh, "P2SH")?;
    let refunder = parse_typed_address(
        bitcoiny,
        &request.refunder_p2pkh,
        AddressType::P2pkh,
        "refunder P2PKH",
    )?;

    let secret_hash = crate::primitives::hash::hash160(&request.secret);

    let htlc = HtlcScript {
        refunder_pkh: pubkey_hash_of(&refunder)?,
        lock_time: request.lock_time,
        redeemer_pkh: redeem_pubkey.pubkey_hash().to_byte_array(),
        secret_hash,
    };

    verify_p2sh(bitcoiny, &htlc, &p2sh)?;

    let funding = single_funding_output(bitcoiny, &p2sh, request.fee)?;
    let redeem_amount = funding.value - request.fee;

    info!(
        "redeeming {} from {} to {}",
        bitcoiny.format_amount(redeem_amount),
        request.p2sh_address,
        bitcoiny.pkh_to_address(htlc.redeemer_pkh)
    );

    build_redeem_transaction(
        redeem_amount,
        secret_key,
        redeem_pubkey,
        &request.secret,
        funding,
        &htlc.redeem_script(),
    )
}

/// Builds the time-locked refund spend of an HTLC funding output:
/// nLockTime = lockTime, sequence below final, scriptSig
/// `<sig> OP_FALSE <redeemScript>`.
pub fn build_refund_transaction(
    refund_amount: u64,
    secret_key: SecretKey,
    public_key: CompressedPublicKey,
    funding: FundingOutput,
    redeem_script: &Script,
    lock_time: u32,
) -> Result<Transaction, SwapErr> {
    let mut transaction = Transaction {
        version: Version::ONE,
        lock_time: LockTime::from_consensus(lock_time),
        input: vec![TxIn {
            previous_output: funding.outpoint,
            script_sig: ScriptBuf::new(),
            // nLockTime only binds while the sequence is below final
            sequence: Sequence(0xffff_fffe),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(refund_amount),
            script_pubkey: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        }],
    };

    let signature = sign_htlc_input(&transaction, redeem_script, secret_key)?;

    transaction.input[0].script_sig = Builder::new()
        .push_slice(signature)
        .push_opcode(opcodes::OP_FALSE)
        .push_slice(script_push(redeem_script)?)
        .into_script();

    Ok(transaction)
}

/// Builds the secret-revealing redeem spend of an HTLC funding output:
/// scriptSig `<sig> <pubKey> <secret> OP_TRUE <redeemScript>`.
pub fn build_redeem_transaction(
    redeem_amount: u64,
    secret_key: SecretKey,
    public_key: CompressedPublicKey,
    secret: &[u8],
    funding: FundingOutput,
    redeem_script: &Script,
) -> Result<Transaction, SwapErr> {
    let mut transaction = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(redeem_amount),
            script_pubkey: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        }],
    };

    let signature = sign_htlc_input(&transaction, redeem_script, secret_key)?;

    let secret_push = PushBytesBuf::try_from(secret.to_vec())
        .map_err(|_| SwapErr::InvalidInput("secret too long"))?;

    transaction.input[0].script_sig = Builder::new()
        .push_slice(signature)
        .push_slice(public_key.to_bytes())
        .push_slice(secret_push)
        .push_opcode(opcodes::OP_TRUE)
        .push_slice(script_push(redeem_script)?)
        .into_script();

    Ok(transaction)
}

fn compressed_pubkey<P: BlockchainProvider>(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    secret_key: SecretKey,
    bitcoiny: &Bitcoiny<P>,
) -> CompressedPublicKey {
    let private_key = PrivateKey::new(secret_key, bitcoiny.network);
    CompressedPublicKey::from_private_key(secp, &private_key)
        .expect("compressed private key yields a compressed public key")
}

fn parse_typed_address<P: BlockchainProvider>(
    bitcoiny: &Bitcoiny<P>,
    encoded: &str,
    expected: AddressType,
    what: &'static str,
) -> Result<Address, SwapErr> {
    let address = bitcoiny
        .parse_address(encoded)
        .map_err(|_| SwapErr::InvalidInput(what))?;

    if address.address_type() != Some(expected) {
        return Err(SwapErr::InvalidInput(what));
    }

    Ok(address)
}

/// Extracts the 20-byte hash from a P2PKH output script
/// (OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG).
fn pubkey_hash_of(address: &Address) -> Result<[u8; 20], SwapErr> {
    let script = address.script_pubkey();
    let bytes = script.as_bytes();

    if bytes.len() == 25 && bytes[0] == 0x76 && bytes[1] == 0xa9 && bytes[2] == 0x14 {
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes[3..23]);
        return Ok(out);
    }

    Err(SwapErr::InvalidInput("not a P2PKH address"))
}

/// The P2SH derived from the reconstructed contract must equal the
/// advertised one; any mismatch aborts the flow.
fn verify_p2sh<P: BlockchainProvider>(
    bitcoiny: &Bitcoiny<P>,
    htlc: &HtlcScript,
    advertised: &Address,
) -> Result<(), SwapErr> {
    let derived = htlc.p2sh_address(bitcoiny.network);

    if &derived != advertised {
        return Err(SwapErr::SafetyViolation(format!(
            "derived P2SH address {derived} does not match given address {advertised}"
        )));
    }

    Ok(())
}

/// Refunds are gated on both the contract's lock time and the external
/// chain's median-time-past, compared in seconds.
fn check_refund_timing<P: BlockchainProvider>(
    bitcoiny: &Bitcoiny<P>,
    lock_time: u32,
    now_secs: u64,
) -> Result<(), SwapErr> {
    let median_time = bitcoiny.median_block_time()?;

    if now_secs < u64::from(median_time) {
        return Err(SwapErr::SafetyViolation(format!(
            "too soon ({now_secs}) to refund based on median block time {median_time}"
        )));
    }

    if now_secs < u64::from(lock_time) {
        return Err(SwapErr::SafetyViolation(format!(
            "too soon ({now_secs}) to refund based on lockTime {lock_time}"
        )));
    }

    Ok(())
}

/// Requires the P2SH to hold exactly one confirmed UTXO worth more than
/// the fee.
fn single_funding_output<P: BlockchainProvider>(
    bitcoiny: &Bitcoiny<P>,
    p2sh: &Address,
    fee: u64,
) -> Result<FundingOutput, SwapErr> {
    let unspent = bitcoiny
        .provider
        .unspent_outputs(p2sh.script_pubkey().as_bytes())?;

    if unspent.is_empty() {
        return Err(SwapErr::SafetyViolation(
            "can't spend unfunded or already-spent P2SH".to_owned(),
        ));
    }

    if unspent.len() != 1 {
        return Err(SwapErr::SafetyViolation(format!(
            "expecting only one unspent output for P2SH, found {}",
            unspent.len()
        )));
    }

    let output = &unspent[0];
    if output.value <= fee {
        return Err(SwapErr::SafetyViolation(format!(
            "fee {} exceeds funding output value {}",
            fee, output.value
        )));
    }

    Ok(FundingOutput {
        outpoint: OutPoint {
            txid: Txid::from_byte_array(output.hash),
            vout: output.index,
        },
        value: output.value,
    })
}

/// Legacy SIGHASH_ALL signature over the redeem script, DER plus the
/// sighash-type byte, ready for a scriptSig push.
fn sign_htlc_input(
    transaction: &Transaction,
    redeem_script: &Script,
    secret_key: SecretKey,
) -> Result<PushBytesBuf, SwapErr> {
    let secp = Secp256k1::new();

    let sighash = SighashCache::new(transaction)
        .legacy_signature_hash(0, redeem_script, EcdsaSighashType::All.to_u32())
        .map_err(|_| SwapErr::InvalidInput("sighash input index"))?;

    let signature = secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &secret_key);

    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);

    PushBytesBuf::try_from(bytes).map_err(|_| SwapErr::InvalidInput("signature push size"))
}

fn script_push(script: &Script) -> Result<PushBytesBuf, SwapErr> {
    PushBytesBuf::try_from(script.to_bytes())
        .map_err(|_| SwapErr::InvalidInput("redeem script too long"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crosschain::provider::UnspentOutput;
    use crate::crosschain::test_support::MockProvider;
    use bitcoin::consensus::encode::serialize as consensus_serialize;
    use bitcoin::Network;

    const LOCK_TIME: u32 = 1_585_920_000;
    const FEE: u64 = 10_000; // 0.0001 BTC
    const FUNDING: u64 = 100_000; // 0.0010 BTC

    fn bitcoiny(height: u32) -> Bitcoiny<MockProvider> {
        Bitcoiny::new(MockProvider::new(height), Network::Testnet, "BTC", 10_000, 1_000)
    }

    fn refund_secret() -> [u8; 32] {
        let mut secret = [0u8; 32];
        secret[..7].copy_from_slice(b"refund!");
        secret[31] = 1;
        secret
    }

    fn redeem_secret_key() -> [u8; 32] {
        let mut secret = [0u8; 32];
        secret[..7].copy_from_slice(b"redeem!");
        secret[31] = 2;
        secret
    }

    /// Derives the request fixture plus the P2SH address both parties
    /// advertise for it.
    fn refund_fixture(chain: &Bitcoiny<MockProvider>) -> (RefundRequest, HtlcScript) {
        let secp = Secp256k1::new();
        let refund_key = SecretKey::from_slice(&refund_secret()).unwrap();
        let refund_pub = compressed_pubkey(&secp, refund_key, chain);

        let redeem_key = SecretKey::from_slice(&redeem_secret_key()).unwrap();
        let redeem_pub = compressed_pubkey(&secp, redeem_key, chain);

        let htlc = HtlcScript {
            refunder_pkh: refund_pub.pubkey_hash().to_byte_array(),
            lock_time: LOCK_TIME,
            redeemer_pkh: redeem_pub.pubkey_hash().to_byte_array(),
            secret_hash: crate::primitives::hash::hash160(&[0x77u8; 32]),
        };

        let request = RefundRequest {
            p2sh_address: htlc.p2sh_address(Network::Testnet).to_string(),
            refund_secret: refund_secret(),
            redeemer_p2pkh: chain.pkh_to_address(htlc.redeemer_pkh),
            secret_hash: htlc.secret_hash,
            lock_time: LOCK_TIME,
            fee: FEE,
        };

        (request, htlc)
    }

    fn fund_p2sh(chain: &Bitcoiny<MockProvider>, htlc: &HtlcScript, value: u64) {
        let script = htlc.p2sh_address(Network::Testnet).script_pubkey();
        chain.provider().utxos.write().insert(
            script.to_bytes(),
            vec![UnspentOutput {
                hash: [0xfe; 32],
                index: 0,
                height: 90,
                value,
                script_pub_key: script.to_bytes(),
            }],
        );
    }

    fn install_mtp(chain: &Bitcoiny<MockProvider>, median: u32) {
        // 11 headers whose 6th-descending timestamp is `median`
        let timestamps: Vec<u32> = (0..11).map(|i| median - 50 + i * 10).collect();
        chain.provider().install_headers(&timestamps);
    }

    #[test]
    fn refund_happy_path_builds_broadcastable_transaction() {
        let chain = bitcoiny(100);
        let (request, htlc) = refund_fixture(&chain);
        fund_p2sh(&chain, &htlc, FUNDING);
        install_mtp(&chain, LOCK_TIME - 1000);

        let transaction = checked_refund(&chain, &request, u64::from(LOCK_TIME) + 60).unwrap();

        // 0.0010 funding - 0.0001 fee = 0.0009 to the refunder
        assert_eq!(transaction.output.len(), 1);
        assert_eq!(transaction.output[0].value.to_sat(), 90_000);

        let secp = Secp256k1::new();
        let refund_key = SecretKey::from_slice(&refund_secret()).unwrap();
        let refund_pub = compressed_pubkey(&secp, refund_key, &chain);
        assert_eq!(
            transaction.output[0].script_pubkey,
            ScriptBuf::new_p2pkh(&refund_pub.pubkey_hash())
        );

        assert_eq!(transaction.lock_time, LockTime::from_consensus(LOCK_TIME));
        assert_eq!(transaction.input[0].sequence, Sequence(0xffff_fffe));

        // scriptSig ends with OP_FALSE + the full redeem script
        let script_sig = transaction.input[0].script_sig.as_bytes();
        let redeem_bytes = htlc.redeem_script().to_bytes();
        assert_eq!(
            &script_sig[script_sig.len() - redeem_bytes.len()..],
            redeem_bytes.as_slice()
        );

        // Serialises without error
        assert!(!consensus_serialize(&transaction).is_empty());
    }

    #[test]
    fn refund_too_early_is_a_safety_violation() {
        let chain = bitcoiny(100);
        let (request, htlc) = refund_fixture(&chain);
        fund_p2sh(&chain, &htlc, FUNDING);
        install_mtp(&chain, LOCK_TIME - 1000);

        let result = checked_refund(&chain, &request, u64::from(LOCK_TIME) - 60);
        assert!(matches!(result, Err(SwapErr::SafetyViolation(_))));
    }

    #[test]
    fn refund_rejects_p2sh_mismatch() {
        let chain = bitcoiny(100);
        let (mut request, htlc) = refund_fixture(&chain);
        fund_p2sh(&chain, &htlc, FUNDING);
        install_mtp(&chain, LOCK_TIME - 1000);

        // Advertise a P2SH derived from a different lock time
        request.p2sh_address = HtlcScript {
            lock_time: LOCK_TIME + 1,
            ..htlc
        }
        .p2sh_address(Network::Testnet)
        .to_string();

        let result = checked_refund(&chain, &request, u64::from(LOCK_TIME) + 60);
        assert!(matches!(result, Err(SwapErr::SafetyViolation(_))));
    }

    #[test]
    fn refund_requires_exactly_one_utxo() {
        let chain = bitcoiny(100);
        let (request, htlc) = refund_fixture(&chain);
        install_mtp(&chain, LOCK_TIME - 1000);

        // Unfunded
        let result = checked_refund(&chain, &request, u64::from(LOCK_TIME) + 60);
        assert!(matches!(result, Err(SwapErr::SafetyViolation(_))));

        // Two outputs
        let script = htlc.p2sh_address(Network::Testnet).script_pubkey();
        let utxo = UnspentOutput {
            hash: [0xfe; 32],
            index: 0,
            height: 90,
            value: FUNDING,
            script_pub_key: script.to_bytes(),
        };
        chain.provider().utxos.write().insert(
            script.to_bytes(),
            vec![utxo.clone(), UnspentOutput { index: 1, ..utxo }],
        );

        let result = checked_refund(&chain, &request, u64::from(LOCK_TIME) + 60);
        assert!(matches!(result, Err(SwapErr::SafetyViolation(_))));
    }

    #[test]
    fn redeem_reveals_secret_in_script_sig() {
        let chain = bitcoiny(100);

        let secp = Secp256k1::new();
        let refund_key = SecretKey::from_slice(&refund_secret()).unwrap();
        let refund_pub = compressed_pubkey(&secp, refund_key, &chain);
        let redeem_key = SecretKey::from_slice(&redeem_secret_key()).unwrap();
        let redeem_pub = compressed_pubkey(&secp, redeem_key, &chain);

        let secret = vec![0x77u8; 32];
        let htlc = HtlcScript {
            refunder_pkh: refund_pub.pubkey_hash().to_byte_array(),
            lock_time: LOCK_TIME,
            redeemer_pkh: redeem_pub.pubkey_hash().to_byte_array(),
            secret_hash: crate::primitives::hash::hash160(&secret),
        };
        fund_p2sh(&chain, &htlc, FUNDING);

        let request = RedeemRequest {
            p2sh_address: htlc.p2sh_address(Network::Testnet).to_string(),
            redeem_secret: redeem_secret_key(),
            refunder_p2pkh: chain.pkh_to_address(htlc.refunder_pkh),
            secret: secret.clone(),
            lock_time: LOCK_TIME,
            fee: FEE,
        };

        let transaction = checked_redeem(&chain, &request).unwrap();

        assert_eq!(transaction.lock_time, LockTime::ZERO);
        assert_eq!(transaction.input[0].sequence, Sequence::MAX);
        assert_eq!(transaction.output[0].value.to_sat(), FUNDING - FEE);
        assert_eq!(
            transaction.output[0].script_pubkey,
            ScriptBuf::new_p2pkh(&redeem_pub.pubkey_hash())
        );

        // The secret is pushed in the scriptSig
        let script_sig = transaction.input[0].script_sig.to_bytes();
        assert!(script_sig
            .windows(secret.len())
            .any(|window| window == secret.as_slice()));
    }

    #[test]
    fn private_key_auto_trim() {
        // 38-byte dump: version + key + compression flag + checksum tail
        let mut dumped = vec![0xef];
        dumped.extend_from_slice(&refund_secret());
        dumped.extend_from_slice(&[0x01, 0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(dumped.len(), 38);

        assert_eq!(trim_private_key(&dumped).unwrap(), refund_secret());

        // Raw 32 bytes pass through
        assert_eq!(trim_private_key(&refund_secret()).unwrap(), refund_secret());

        // Anything else is invalid
        assert!(trim_private_key(&[0u8; 31]).is_err());
        assert!(trim_private_key(&[0u8; 40]).is_err());
    }
}
