// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bitcoin::blockdata::opcodes::all as op;
use bitcoin::blockdata::script::Builder;
use bitcoin::{Address, Network, Script, ScriptBuf};

/// Length of the swap secret in bytes, enforced by the script itself.
pub const SECRET_LENGTH: i64 = 32;

#[derive(Debug)]
pub enum HtlcErr {
    /// Script bytes do not match the canonical HTLC layout
    NotAnHtlcScript(&'static str),

    /// Malformed key, hash or lock time
    InvalidInput(&'static str),
}

/// Hash-time-locked contract between the native chain and the external
/// chain: (refunderPKH, lockTime, redeemerPKH, secretHash160). Its
/// canonical serialisation is the redeem script; its address is the P2SH
/// of that script. A single byte of deviation changes the address, so the
/// byte layout here is part of the external interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HtlcScript {
    pub refunder_pkh: [u8; 20],
    pub lock_time: u32,
    pub redeemer_pkh: [u8; 20],
    pub secret_hash: [u8; 20],
}

impl HtlcScript {
    /// Builds the canonical redeem script:
    ///
    /// ```text
    /// OP_IF
    ///     OP_SIZE <secretLen> OP_EQUALVERIFY
    ///     OP_HASH160 <secretHash> OP_EQUALVERIFY
    ///     OP_DUP OP_HASH160 <redeemerPKH>
    /// OP_ELSE
    ///     <lockTime> OP_CHECKLOCKTIMEVERIFY OP_DROP
    ///     OP_DUP OP_HASH160 <refunderPKH>
    /// OP_ENDIF
    /// OP_EQUALVERIFY OP_CHECKSIG
    /// ```
    #[must_use]
    pub fn redeem_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(op::OP_IF)
            .push_opcode(op::OP_SIZE)
            .push_int(SECRET_LENGTH)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_HASH160)
            .push_slice(self.secret_hash)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_DUP)
            .push_opcode(op::OP_HASH160)
            .push_slice(self.redeemer_pkh)
            .push_opcode(op::OP_ELSE)
            .push_int(i64::from(self.lock_time))
            .push_opcode(op::OP_CLTV)
            .push_opcode(op::OP_DROP)
            .push_opcode(op::OP_DUP)
            .push_opcode(op::OP_HASH160)
            .push_slice(self.refunder_pkh)
            .push_opcode(op::OP_ENDIF)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_CHECKSIG)
            .into_script()
    }

    /// Parses redeem-script bytes back into the contract tuple. Strict:
    /// anything but the canonical layout is rejected.
    pub fn parse(script: &Script) -> Result<Self, HtlcErr> {
        let bytes = script.as_bytes();
        let bad = |what| HtlcErr::NotAnHtlcScript(what);

        let mut pos = 0usize;

        expect(
            bytes,
            &mut pos,
            &[
                op::OP_IF.to_u8(),
                op::OP_SIZE.to_u8(),
                0x01,
                SECRET_LENGTH as u8,
                op::OP_EQUALVERIFY.to_u8(),
                op::OP_HASH160.to_u8(),
                0x14,
            ],
            "secret branch prologue",
        )?;

        let secret_hash = read_hash20(bytes, &mut pos).ok_or(bad("secret hash"))?;

        expect(
            bytes,
            &mut pos,
            &[
                op::OP_EQUALVERIFY.to_u8(),
                op::OP_DUP.to_u8(),
                op::OP_HASH160.to_u8(),
                0x14,
            ],
            "redeemer prologue",
        )?;

        let redeemer_pkh = read_hash20(bytes, &mut pos).ok_or(bad("redeemer PKH"))?;

        expect(bytes, &mut pos, &[op::OP_ELSE.to_u8()], "else")?;

        let lock_time = read_script_num(bytes, &mut pos).ok_or(bad("lock time"))?;
        let lock_time = u32::try_from(lock_time).map_err(|_| bad("lock time range"))?;

        expect(
            bytes,
            &mut pos,
            &[
                op::OP_CLTV.to_u8(),
                op::OP_DROP.to_u8(),
                op::OP_DUP.to_u8(),
                op::OP_HASH160.to_u8(),
                0x14,
            ],
            "refund branch prologue",
        )?;

        let refunder_pkh = read_hash20(bytes, &mut pos).ok_or(bad("refunder PKH"))?;

        expect(
            bytes,
            &mut pos,
            &[
                op::OP_ENDIF.to_u8(),
                op::OP_EQUALVERIFY.to_u8(),
                op::OP_CHECKSIG.to_u8(),
            ],
            "epilogue",
        )?;

        if pos != bytes.len() {
            return Err(bad("trailing bytes"));
        }

        Ok(Self {
            refunder_pkh,
            lock_time,
            redeemer_pkh,
            secret_hash,
        })
    }

    /// P2SH address of the redeem script on the given network.
    #[must_use]
    pub fn p2sh_address(&self, network: Network) -> Address {
        Address::p2sh(&self.redeem_script(), network).expect("HTLC script is below the P2SH limit")
    }
}

fn expect(
    bytes: &[u8],
    pos: &mut usize,
    expected: &[u8],
    what: &'static str,
) -> Result<(), HtlcErr> {
    if bytes.len() < *pos + expected.len() || &bytes[*pos..*pos + expected.len()] != expected {
        return Err(HtlcErr::NotAnHtlcScript(what));
    }
    *pos += expected.len();
    Ok(())
}

fn read_hash20(bytes: &[u8], pos: &mut usize) -> Option<[u8; 20]> {
    if bytes.len() < *pos + 20 {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[*pos..*pos + 20]);
    *pos += 20;
    Some(out)
}

/// Reads one minimally-encoded script number push (length byte + LE bytes,
/// top bit of the last byte is the sign).
fn read_script_num(bytes: &[u8], pos: &mut usize) -> Option<i64> {
    let len = *bytes.get(*pos)? as usize;
    if len == 0 || len > 5 || bytes.len() < *pos + 1 + len {
        return None;
    }

    let data = &bytes[*pos + 1..*pos + 1 + len];
    *pos += 1 + len;

    let mut value: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        if i == len - 1 {
            value |= i64::from(byte & 0x7f) << (8 * i);
            if byte & 0x80 != 0 {
                value = -value;
            }
        } else {
            value |= i64::from(*byte) << (8 * i);
        }
    }

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> HtlcScript {
        HtlcScript {
            refunder_pkh: [0x33; 20],
            lock_time: 1_585_920_000,
            redeemer_pkh: [0x22; 20],
            secret_hash: [0x11; 20],
        }
    }

    #[test]
    fn redeem_script_bytes_are_canonical() {
        let script = contract().redeem_script();

        let mut expected = vec![0x63, 0x82, 0x01, 0x20, 0x88, 0xa9, 0x14];
        expected.extend_from_slice(&[0x11; 20]);
        expected.extend_from_slice(&[0x88, 0x76, 0xa9, 0x14]);
        expected.extend_from_slice(&[0x22; 20]);
        // 1585920000 == 0x5e873800, minimal little-endian push
        expected.extend_from_slice(&[0x67, 0x04, 0x00, 0x38, 0x87, 0x5e, 0xb1, 0x75]);
        expected.extend_from_slice(&[0x76, 0xa9, 0x14]);
        expected.extend_from_slice(&[0x33; 20]);
        expected.extend_from_slice(&[0x68, 0x88, 0xac]);

        assert_eq!(script.as_bytes(), expected.as_slice());
    }

    #[test]
    fn parse_round_trips_and_p2sh_is_stable() {
        let original = contract();
        let script = original.redeem_script();

        let parsed = HtlcScript::parse(&script).unwrap();
        assert_eq!(parsed, original);

        assert_eq!(
            original.p2sh_address(Network::Testnet),
            parsed.p2sh_address(Network::Testnet)
        );
        assert_eq!(parsed.redeem_script(), script);
    }

    #[test]
    fn parse_rejects_mutations() {
        let script = contract().redeem_script();
        let bytes = script.as_bytes();

        // Flip the OP_IF
        let mut mutated = bytes.to_vec();
        mutated[0] = 0x64;
        assert!(HtlcScript::parse(Script::from_bytes(&mutated)).is_err());

        // Truncate
        assert!(HtlcScript::parse(Script::from_bytes(&bytes[..bytes.len() - 1])).is_err());

        // Trailing byte
        let mut extended = bytes.to_vec();
        extended.push(0x00);
        assert!(HtlcScript::parse(Script::from_bytes(&extended)).is_err());
    }

    #[test]
    fn different_lock_times_change_the_address() {
        let a = contract();
        let b = HtlcScript {
            lock_time: a.lock_time + 1,
            ..a
        };

        assert_ne!(
            a.p2sh_address(Network::Testnet),
            b.p2sh_address(Network::Testnet)
        );
    }
}
