// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crosschain::provider::{
    BlockchainProvider, ForeignBlockchainErr, TransactionHash, UnspentOutput,
};
use serde::Serialize;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: &'static str,
    method: String,
    params: serde_json::Value,
}

/// `BlockchainProvider` over a bitcoind-compatible JSON-RPC endpoint.
///
/// UTXO queries go through `scantxoutset`, so no wallet or address index
/// is needed on the node. Address history has no core RPC equivalent and
/// reports `Unsupported`; the swap flows never need it.
pub struct RpcBlockchainProvider {
    url: String,
    user: Option<String>,
    pass: Option<String>,
    client: reqwest::blocking::Client,
}

impl RpcBlockchainProvider {
    pub fn new(url: &str) -> Result<Self, ForeignBlockchainErr> {
        let client = reqwest::blocking::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| ForeignBlockchainErr::Network(e.to_string()))?;

        Ok(Self {
            url: url.to_owned(),
            user: None,
            pass: None,
            client,
        })
    }

    pub fn with_auth(url: &str, user: &str, pass: &str) -> Result<Self, ForeignBlockchainErr> {
        let mut provider = Self::new(url)?;
        provider.user = Some(user.to_owned());
        provider.pass = Some(pass.to_owned());
        Ok(provider)
    }

    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ForeignBlockchainErr> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: "quartz",
            method: method.to_owned(),
            params,
        };

        let mut req = self.client.post(&self.url).json(&request);

        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            req = req.basic_auth(user, Some(pass));
        }

        let response = req
            .send()
            .map_err(|e| ForeignBlockchainErr::Network(e.to_string()))?;

        let json: serde_json::Value = response
            .json()
            .map_err(|e| ForeignBlockchainErr::Network(e.to_string()))?;

        if let Some(error) = json.get("error") {
            if !error.is_null() {
                return Err(ForeignBlockchainErr::Network(format!("RPC error: {error}")));
            }
        }

        json.get("result")
            .cloned()
            .ok_or(ForeignBlockchainErr::InvalidResponse("no result field"))
    }

    fn block_hash(&self, height: u32) -> Result<String, ForeignBlockchainErr> {
        self.call("getblockhash", serde_json::json!([height]))?
            .as_str()
            .map(str::to_owned)
            .ok_or(ForeignBlockchainErr::InvalidResponse("block hash"))
    }
}

/// Txid hex as RPC expects it: displayed (reversed) byte order.
fn txid_hex(tx_hash: &[u8; 32]) -> String {
    let mut reversed = *tx_hash;
    reversed.reverse();
    hex::encode(reversed)
}

fn btc_to_sats(value: f64) -> u64 {
    (value * 100_000_000.0).round() as u64
}

impl BlockchainProvider for RpcBlockchainProvider {
    fn current_height(&self) -> Result<u32, ForeignBlockchainErr> {
        let result = self.call("getblockcount", serde_json::json!([]))?;
        result
            .as_u64()
            .and_then(|h| u32::try_from(h).ok())
            .ok_or(ForeignBlockchainErr::InvalidResponse("block count"))
    }

    fn raw_block_headers(
        &self,
        start_height: u32,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, ForeignBlockchainErr> {
        let mut headers = Vec::with_capacity(count as usize);

        for height in start_height..start_height + count {
            let hash = self.block_hash(height)?;
            let header_hex = self
                .call("getblockheader", serde_json::json!([hash, false]))?
                .as_str()
                .map(str::to_owned)
                .ok_or(ForeignBlockchainErr::InvalidResponse("block header"))?;

            let header = hex::decode(header_hex)
                .map_err(|_| ForeignBlockchainErr::InvalidResponse("block header hex"))?;
            headers.push(header);
        }

        Ok(headers)
    }

    fn confirmed_balance(&self, script_pub_key: &[u8]) -> Result<u64, ForeignBlockchainErr> {
        Ok(self
            .unspent_outputs(script_pub_key)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    fn unspent_outputs(
        &self,
        script_pub_key: &[u8],
    ) -> Result<Vec<UnspentOutput>, ForeignBlockchainErr> {
        let descriptor = format!("raw({})", hex::encode(script_pub_key));
        let result = self.call("scantxoutset", serde_json::json!(["start", [descriptor]]))?;

        let unspents = result
            .get("unspents")
            .and_then(|u| u.as_array())
            .ok_or(ForeignBlockchainErr::InvalidResponse("scantxoutset unspents"))?;

        let mut outputs = Vec::with_capacity(unspents.len());
        for unspent in unspents {
            let txid = unspent
                .get("txid")
                .and_then(|t| t.as_str())
                .ok_or(ForeignBlockchainErr::InvalidResponse("unspent txid"))?;

            let mut hash: [u8; 32] = hex::decode(txid)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or(ForeignBlockchainErr::InvalidResponse("unspent txid hex"))?;
            // Back to internal byte order
            hash.reverse();

            let index = unspent
                .get("vout")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(ForeignBlockchainErr::InvalidResponse("unspent vout"))?;

            let value = unspent
                .get("amount")
                .and_then(|a| a.as_f64())
                .map(btc_to_sats)
                .ok_or(ForeignBlockchainErr::InvalidResponse("unspent amount"))?;

            let height = unspent
                .get("height")
                .and_then(|h| h.as_u64())
                .and_then(|h| u32::try_from(h).ok())
                .unwrap_or(0);

            let script = unspent
                .get("scriptPubKey")
                .and_then(|s| s.as_str())
                .map(hex::decode)
                .transpose()
                .map_err(|_| ForeignBlockchainErr::InvalidResponse("unspent script hex"))?
                .unwrap_or_default();

            outputs.push(UnspentOutput {
                hash,
                index,
                height,
                value,
                script_pub_key: script,
            });
        }

        Ok(outputs)
    }

    fn raw_transaction(&self, tx_hash: &[u8; 32]) -> Result<Vec<u8>, ForeignBlockchainErr> {
        let result = self.call(
            "getrawtransaction",
            serde_json::json!([txid_hex(tx_hash), false]),
        )?;

        let raw_hex = result
            .as_str()
            .ok_or(ForeignBlockchainErr::InvalidResponse("raw transaction"))?;

        hex::decode(raw_hex).map_err(|_| ForeignBlockchainErr::InvalidResponse("raw transaction hex"))
    }

    fn address_transactions(
        &self,
        _script_pub_key: &[u8],
    ) -> Result<Vec<TransactionHash>, ForeignBlockchainErr> {
        Err(ForeignBlockchainErr::Unsupported(
            "bitcoind carries no address history index",
        ))
    }

    fn broadcast_transaction(&self, raw: &[u8]) -> Result<String, ForeignBlockchainErr> {
        let result = self.call("sendrawtransaction", serde_json::json!([hex::encode(raw)]))?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or(ForeignBlockchainErr::InvalidResponse("broadcast txid"))
    }
}
