// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Standalone HTLC refund tool: recovers funds locked in an atomic-swap
//! P2SH after its lock time has passed.

use chrono::{TimeZone, Utc};
use quartz::crosschain::rpc::RpcBlockchainProvider;
use quartz::crosschain::swap::{self, trim_private_key, RefundRequest, DEFAULT_SWAP_FEE};
use quartz::crosschain::{Bitcoiny, SwapErr};
use quartz::settings::{Settings, SETTINGS_PATH_ENV};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn usage(error: Option<&str>) -> ! {
    if let Some(error) = error {
        eprintln!("{error}");
    }

    eprintln!(
        "usage: quartz-refund [--config <settings-file>] <P2SH-address> <refund-PRIVATE-KEY-hex> \
         <redeem-P2PKH> <HASH160-of-secret-hex> <locktime-seconds> (<fee-in-coins>)"
    );
    eprintln!(
        "example: quartz-refund 2NEZboTLhBDPPQciR7sExBhy3TsDi7wV3Cv \\\n\
         \tef027fb5828c5e201eaf6de4cd3b0b340d16a191ef848cd691f35ef8f727358c9c01b576fb7e \\\n\
         \tn2N5VKrzq39nmuefZwp3wBiF4icdXX2B6o \\\n\
         \td1b64100879ad93ceaa3c15929b6fe8550f54967 \\\n\
         \t1585920000"
    );
    std::process::exit(1)
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_flag = take_config_flag(&mut args);

    if args.len() < 5 || args.len() > 6 {
        usage(None);
    }

    let key_bytes = match hex::decode(&args[1]) {
        Ok(bytes) => bytes,
        Err(_) => usage(Some("refund private key must be hex")),
    };
    // Dumped keys carry a version byte and checksum tail
    let refund_secret = match trim_private_key(&key_bytes) {
        Ok(secret) => secret,
        Err(_) => usage(Some("refund private key must be 32 bytes")),
    };

    let secret_hash: [u8; 20] = match hex::decode(&args[3]) {
        Ok(bytes) => match bytes.try_into() {
            Ok(hash) => hash,
            Err(_) => usage(Some("HASH160 of secret must be 20 bytes of hex")),
        },
        Err(_) => usage(Some("HASH160 of secret must be 20 bytes of hex")),
    };

    let lock_time: u32 = match args[4].parse() {
        Ok(lock_time) => lock_time,
        Err(_) => usage(Some("locktime must be seconds since epoch")),
    };

    let fee = match args.get(5) {
        Some(arg) => match arg.parse::<f64>() {
            Ok(coins) if coins > 0.0 => (coins * 100_000_000.0).round() as u64,
            _ => usage(Some("fee must be a positive decimal amount")),
        },
        None => DEFAULT_SWAP_FEE,
    };

    let request = RefundRequest {
        p2sh_address: args[0].clone(),
        refund_secret,
        redeemer_p2pkh: args[2].clone(),
        secret_hash,
        lock_time,
        fee,
    };

    let settings_path =
        config_flag.or_else(|| std::env::var_os(SETTINGS_PATH_ENV).map(PathBuf::from));
    let settings = match Settings::load(settings_path.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("settings failure: {err}");
            std::process::exit(2);
        }
    };

    let provider = match build_provider(&settings) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("external node failure: {err}");
            std::process::exit(2);
        }
    };

    let bitcoiny = Bitcoiny::new(
        provider,
        settings.bitcoin_network(),
        &settings.foreign.currency_code,
        settings.foreign.fee_per_kb,
        settings.foreign.p2sh_fee,
    );

    println!("Confirm the following is correct based on the info you've given:");
    println!("P2SH address: {}", request.p2sh_address);
    println!("Redeem address: {}", request.redeemer_p2pkh);
    println!(
        "Redeem script lockTime: {} ({})",
        Utc.timestamp_opt(i64::from(lock_time), 0).unwrap(),
        lock_time
    );
    println!("Refund miner's fee: {}", bitcoiny.format_amount(fee));

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();

    match swap::checked_refund(&bitcoiny, &request, now_secs) {
        Ok(transaction) => {
            let raw = bitcoin::consensus::encode::serialize(&transaction);
            println!("\nLoad this transaction into your wallet and broadcast:");
            println!("{}", hex::encode(raw));
        }

        Err(SwapErr::InvalidInput(what)) => usage(Some(what)),

        Err(SwapErr::SafetyViolation(message)) => {
            eprintln!("{message}");
            std::process::exit(2);
        }

        Err(SwapErr::Foreign(err)) => {
            eprintln!("external chain failure: {err}");
            std::process::exit(2);
        }
    }
}

/// Pulls the first `--config <path>` pair out of the argument list. Takes
/// precedence over the environment variable.
fn take_config_flag(args: &mut Vec<String>) -> Option<PathBuf> {
    let index = args.iter().position(|arg| arg == "--config")?;

    if index + 1 >= args.len() {
        usage(Some("--config requires a settings file path"));
    }

    let path = PathBuf::from(args.remove(index + 1));
    args.remove(index);
    Some(path)
}

fn build_provider(
    settings: &Settings,
) -> Result<RpcBlockchainProvider, quartz::crosschain::ForeignBlockchainErr> {
    match (&settings.foreign.node_user, &settings.foreign.node_password) {
        (Some(user), Some(pass)) => {
            RpcBlockchainProvider::with_auth(&settings.foreign.node_url, user, pass)
        }
        _ => RpcBlockchainProvider::new(&settings.foreign.node_url),
    }
}
