// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub mod htlc;
pub mod provider;
pub mod rpc;
pub mod swap;
pub mod wallet;

pub use htlc::{HtlcErr, HtlcScript};
pub use provider::{BlockchainProvider, ForeignBlockchainErr, TransactionHash, UnspentOutput};
pub use swap::{RedeemRequest, RefundRequest, SwapErr};

use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::deserialize as consensus_deserialize;
use bitcoin::hashes::Hash as _;
use bitcoin::{Address, AddressType, Network, PubkeyHash, ScriptBuf, Transaction, TxOut};
use parking_lot::RwLock;
use std::collections::HashSet;

pub const HASH160_LENGTH: usize = 20;

/// Byte offset into raw legacy block headers to the block timestamp.
const TIMESTAMP_OFFSET: usize = 4 + 32 + 32;

/// Behaviour every supported external chain exposes. The shared plumbing
/// lives in [`Bitcoiny`]; per-chain differences (network parameters, fee
/// policy, currency code) are plain data on the composed value.
pub trait ForeignBlockchain {
    fn currency_code(&self) -> &str;

    fn network(&self) -> Network;

    fn is_valid_address(&self, address: &str) -> bool;

    fn is_valid_wallet_key(&self, wallet_key: &str) -> bool;

    /// Default relay fee, in sats per 1000 bytes.
    fn fee_per_kb(&self) -> u64;

    /// Fixed P2SH spending fee in sats per 1000 bytes, optionally for a
    /// historic timestamp (milliseconds since epoch).
    fn p2sh_fee(&self, timestamp: Option<u64>) -> Result<u64, ForeignBlockchainErr>;
}

/// Bitcoin-like (Bitcoin, Litecoin, ...) chain support: one reusable
/// composition over a [`BlockchainProvider`], parameterised by network and
/// fee policy instead of subclassing per chain.
pub struct Bitcoiny<P: BlockchainProvider> {
    pub(crate) provider: P,
    pub(crate) network: Network,
    pub(crate) currency_code: String,
    pub(crate) default_fee_per_kb: u64,
    pub(crate) default_p2sh_fee: u64,

    /// Compressed public keys known to have historical activity but no
    /// current UTXOs. Treated as permanently used by the key-chain walker.
    pub(crate) spent_keys: RwLock<HashSet<[u8; 33]>>,
}

impl<P: BlockchainProvider> Bitcoiny<P> {
    #[must_use]
    pub fn new(
        provider: P,
        network: Network,
        currency_code: &str,
        default_fee_per_kb: u64,
        default_p2sh_fee: u64,
    ) -> Self {
        Self {
            provider,
            network,
            currency_code: currency_code.to_owned(),
            default_fee_per_kb,
            default_p2sh_fee,
            spent_keys: RwLock::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Formats an unscaled satoshi amount with the chain's currency code.
    #[must_use]
    pub fn format_amount(&self, sats: u64) -> String {
        format!(
            "{}.{:08} {}",
            sats / 100_000_000,
            sats % 100_000_000,
            self.currency_code
        )
    }

    pub fn parse_address(&self, encoded: &str) -> Result<Address, ForeignBlockchainErr> {
        encoded
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|_| ForeignBlockchainErr::Error("invalid address"))?
            .require_network(self.network)
            .map_err(|_| ForeignBlockchainErr::Error("address is for another network"))
    }

    /// P2PKH address for the given public key hash.
    #[must_use]
    pub fn pkh_to_address(&self, public_key_hash: [u8; 20]) -> String {
        Address::p2pkh(PubkeyHash::from_byte_array(public_key_hash), self.network).to_string()
    }

    /// P2SH address for the given redeem script bytes.
    #[must_use]
    pub fn derive_p2sh_address(&self, redeem_script: &ScriptBuf) -> String {
        Address::p2sh(redeem_script, self.network)
            .expect("redeem script is below the P2SH limit")
            .to_string()
    }

    /// Median timestamp of the latest 11 blocks, in seconds. A refund is
    /// only valid once this exceeds the contract's lock time.
    pub fn median_block_time(&self) -> Result<u32, ForeignBlockchainErr> {
        let height = self.provider.current_height()?;

        // Latest 11 blocks
        let headers = self.provider.raw_block_headers(height.saturating_sub(11), 11)?;
        if headers.len() < 11 {
            return Err(ForeignBlockchainErr::NotEnoughBlocks);
        }

        let mut timestamps = Vec::with_capacity(headers.len());
        for header in &headers {
            if header.len() < TIMESTAMP_OFFSET + 4 {
                return Err(ForeignBlockchainErr::InvalidResponse("short block header"));
            }
            timestamps.push(crate::codec::u32_from_le(header, TIMESTAMP_OFFSET));
        }

        // Descending order, pick the median
        timestamps.sort_by(|a, b| b.cmp(a));
        Ok(timestamps[5])
    }

    /// Confirmed balance of the given Base58 address.
    pub fn confirmed_balance(&self, base58_address: &str) -> Result<u64, ForeignBlockchainErr> {
        let script = self.address_to_script_pub_key(base58_address)?;
        self.provider.confirmed_balance(script.as_bytes())
    }

    /// Unspent outputs pertaining to the given Base58 address.
    pub fn unspent_outputs(
        &self,
        base58_address: &str,
    ) -> Result<Vec<UnspentOutput>, ForeignBlockchainErr> {
        let script = self.address_to_script_pub_key(base58_address)?;
        self.provider.unspent_outputs(script.as_bytes())
    }

    /// Outputs of the transaction with the given id.
    pub fn outputs(&self, tx_hash: &[u8; 32]) -> Result<Vec<TxOut>, ForeignBlockchainErr> {
        let raw = self.provider.raw_transaction(tx_hash)?;
        let transaction: Transaction = consensus_deserialize(&raw)
            .map_err(|_| ForeignBlockchainErr::InvalidResponse("undecodable transaction"))?;
        Ok(transaction.output)
    }

    /// Confirmed transactions involving the given Base58 address.
    pub fn address_transactions(
        &self,
        base58_address: &str,
    ) -> Result<Vec<TransactionHash>, ForeignBlockchainErr> {
        let script = self.address_to_script_pub_key(base58_address)?;
        self.provider.address_transactions(script.as_bytes())
    }

    /// Broadcasts to the external network; returns the txid as hex.
    pub fn broadcast_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<String, ForeignBlockchainErr> {
        let raw = bitcoin::consensus::encode::serialize(transaction);
        self.provider.broadcast_transaction(&raw)
    }

    pub(crate) fn address_to_script_pub_key(
        &self,
        base58_address: &str,
    ) -> Result<ScriptBuf, ForeignBlockchainErr> {
        Ok(self.parse_address(base58_address)?.script_pubkey())
    }
}

impl<P: BlockchainProvider> ForeignBlockchain for Bitcoiny<P> {
    fn currency_code(&self) -> &str {
        &self.currency_code
    }

    fn network(&self) -> Network {
        self.network
    }

    fn is_valid_address(&self, address: &str) -> bool {
        match self.parse_address(address) {
            Ok(address) => matches!(
                address.address_type(),
                Some(AddressType::P2pkh) | Some(AddressType::P2sh)
            ),
            Err(_) => false,
        }
    }

    fn is_valid_wallet_key(&self, wallet_key: &str) -> bool {
        match wallet_key.parse::<bitcoin::bip32::Xpriv>() {
            Ok(xpriv) => xpriv.network == self.network.into(),
            Err(_) => false,
        }
    }

    fn fee_per_kb(&self) -> u64 {
        self.default_fee_per_kb
    }

    fn p2sh_fee(&self, _timestamp: Option<u64>) -> Result<u64, ForeignBlockchainErr> {
        Ok(self.default_p2sh_fee)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::provider::{
        BlockchainProvider, ForeignBlockchainErr, TransactionHash, UnspentOutput,
    };
    use parking_lot::RwLock;
    use std::collections::HashMap;

    /// Scripted provider for tests: per-script UTXO sets and histories,
    /// plus a fixed chain of raw headers.
    #[derive(Default)]
    pub struct MockProvider {
        pub height: u32,
        pub headers: RwLock<HashMap<u32, Vec<u8>>>,
        pub utxos: RwLock<HashMap<Vec<u8>, Vec<UnspentOutput>>>,
        pub history: RwLock<HashMap<Vec<u8>, Vec<TransactionHash>>>,
        pub raw_transactions: RwLock<HashMap<[u8; 32], Vec<u8>>>,
        pub broadcasts: RwLock<Vec<Vec<u8>>>,
    }

    impl MockProvider {
        pub fn new(height: u32) -> Self {
            Self {
                height,
                ..Default::default()
            }
        }

        /// Installs 11 legacy headers ending at the tip, with the given
        /// timestamps (oldest first).
        pub fn install_headers(&self, timestamps: &[u32]) {
            let mut headers = self.headers.write();
            let start = self.height - timestamps.len() as u32;
            for (i, ts) in timestamps.iter().enumerate() {
                let mut header = vec![0u8; 80];
                header[68..72].copy_from_slice(&ts.to_le_bytes());
                headers.insert(start + i as u32, header);
            }
        }
    }

    impl BlockchainProvider for MockProvider {
        fn current_height(&self) -> Result<u32, ForeignBlockchainErr> {
            Ok(self.height)
        }

        fn raw_block_headers(
            &self,
            start_height: u32,
            count: u32,
        ) -> Result<Vec<Vec<u8>>, ForeignBlockchainErr> {
            let headers = self.headers.read();
            Ok((start_height..start_height + count)
                .filter_map(|h| headers.get(&h).cloned())
                .collect())
        }

        fn confirmed_balance(&self, script_pub_key: &[u8]) -> Result<u64, ForeignBlockchainErr> {
            Ok(self
                .utxos
                .read()
                .get(script_pub_key)
                .map(|outs| outs.iter().map(|o| o.value).sum())
                .unwrap_or(0))
        }

        fn unspent_outputs(
            &self,
            script_pub_key: &[u8],
        ) -> Result<Vec<UnspentOutput>, ForeignBlockchainErr> {
            Ok(self
                .utxos
                .read()
                .get(script_pub_key)
                .cloned()
                .unwrap_or_default())
        }

        fn raw_transaction(&self, tx_hash: &[u8; 32]) -> Result<Vec<u8>, ForeignBlockchainErr> {
            self.raw_transactions
                .read()
                .get(tx_hash)
                .cloned()
                .ok_or(ForeignBlockchainErr::NotFound)
        }

        fn address_transactions(
            &self,
            script_pub_key: &[u8],
        ) -> Result<Vec<TransactionHash>, ForeignBlockchainErr> {
            Ok(self
                .history
                .read()
                .get(script_pub_key)
                .cloned()
                .unwrap_or_default())
        }

        fn broadcast_transaction(&self, raw: &[u8]) -> Result<String, ForeignBlockchainErr> {
            self.broadcasts.write().push(raw.to_vec());
            Ok(hex::encode(crate::primitives::hash::hash256(raw)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockProvider;
    use super::*;

    fn bitcoiny(height: u32) -> Bitcoiny<MockProvider> {
        Bitcoiny::new(MockProvider::new(height), Network::Testnet, "BTC", 10_000, 1_000)
    }

    #[test]
    fn median_block_time_picks_sixth_descending() {
        let chain = bitcoiny(100);
        chain.provider().install_headers(&[
            10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110,
        ]);

        assert_eq!(chain.median_block_time().unwrap(), 60);
    }

    #[test]
    fn median_block_time_requires_eleven_headers() {
        let chain = bitcoiny(100);
        chain
            .provider()
            .install_headers(&[10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);

        assert!(matches!(
            chain.median_block_time(),
            Err(ForeignBlockchainErr::NotEnoughBlocks)
        ));
    }

    #[test]
    fn address_validity_covers_p2pkh_and_p2sh_only() {
        let chain = bitcoiny(1);

        assert!(chain.is_valid_address("n2N5VKrzq39nmuefZwp3wBiF4icdXX2B6o"));
        assert!(chain.is_valid_address("2NEZboTLhBDPPQciR7sExBhy3TsDi7wV3Cv"));
        // Mainnet address on testnet
        assert!(!chain.is_valid_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        // Bech32 is not in scope for HTLC plumbing
        assert!(!chain.is_valid_address("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx"));
        assert!(!chain.is_valid_address("garbage"));
    }

    #[test]
    fn amount_formatting_keeps_eight_decimals() {
        let chain = bitcoiny(1);
        assert_eq!(chain.format_amount(123_456_789), "1.23456789 BTC");
        assert_eq!(chain.format_amount(1_000), "0.00001000 BTC");
    }
}
