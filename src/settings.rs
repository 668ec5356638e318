// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::AtSettings;
use bitcoin::Network as BitcoinNetwork;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming the settings file for the standalone tools.
pub const SETTINGS_PATH_ENV: &str = "QUARTZ_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Network settings.
    pub network: NetworkSettings,

    /// Node settings.
    pub node: NodeSettings,

    /// External-chain settings.
    pub foreign: ForeignSettings,

    /// AT engine consensus parameters.
    pub at: AtSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Which network to operate on. Possible values: mainnet and testnet.
    #[serde(alias = "networkname")]
    pub network_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Connection URL of the node's repository.
    #[serde(alias = "repositoryurl")]
    pub repository_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignSettings {
    /// JSON-RPC endpoint of the external-chain node.
    #[serde(alias = "nodeurl")]
    pub node_url: String,

    /// RPC user, if the node requires auth.
    #[serde(alias = "nodeuser")]
    pub node_user: Option<String>,

    /// RPC password, if the node requires auth.
    #[serde(alias = "nodepassword")]
    pub node_password: Option<String>,

    /// Default relay fee in sats per 1000 bytes.
    #[serde(alias = "feeperkb")]
    pub fee_per_kb: u64,

    /// Fixed P2SH spending fee in sats per 1000 bytes.
    #[serde(alias = "p2shfee")]
    pub p2sh_fee: u64,

    /// Display code of the external currency.
    #[serde(alias = "currencycode")]
    pub currency_code: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: NetworkSettings {
                network_name: "mainnet".to_owned(),
            },
            node: NodeSettings {
                repository_url: "file:db/blockchain".to_owned(),
            },
            foreign: ForeignSettings {
                node_url: "http://127.0.0.1:8332".to_owned(),
                node_user: None,
                node_password: None,
                fee_per_kb: 10_000,
                p2sh_fee: 10_000,
                currency_code: "BTC".to_owned(),
            },
            at: AtSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional file, with `quartz_`-prefixed
    /// environment variables taking precedence. Missing keys fall back to
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Config::try_from(&Settings::default())?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            let path = path
                .to_str()
                .ok_or_else(|| ConfigError::Message("non-UTF8 settings path".to_owned()))?;
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(Environment::with_prefix("quartz").separator("_"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.network.network_name.as_str() {
            "mainnet" | "testnet" => {}
            other => {
                return Err(ConfigError::Message(format!(
                    "unknown network {other:?}, expected mainnet or testnet"
                )))
            }
        }

        self.at.validate();
        Ok(())
    }

    /// The external chain's network matching our configured network.
    #[must_use]
    pub fn bitcoin_network(&self) -> BitcoinNetwork {
        match self.network.network_name.as_str() {
            "testnet" => BitcoinNetwork::Testnet,
            _ => BitcoinNetwork::Bitcoin,
        }
    }
}
