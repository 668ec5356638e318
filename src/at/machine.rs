// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::at::Timestamp;
use crate::codec::LeReader;
use crate::consensus::{AtSettings, Money};

/// Max bytecode segment size in bytes
pub const MAX_CODE_SIZE: usize = 65_536;

/// Max data segment size in bytes
pub const MAX_DATA_SIZE: usize = 65_536;

/// Max user/call stack depth per round
pub const STACK_SIZE: usize = 256;

const FLAG_STOPPED: u8 = 1;
const FLAG_FINISHED: u8 = 1 << 1;
const FLAG_FROZEN: u8 = 1 << 2;
const FLAG_SLEEPING: u8 = 1 << 3;
const FLAG_FATAL: u8 = 1 << 4;
const FLAG_FIRST_AFTER_SLEEP: u8 = 1 << 5;

/// CIYAM AT v2 instruction set. Byte values are consensus-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    SetVal = 0x01,
    SetDat = 0x02,
    ClrDat = 0x03,
    IncDat = 0x04,
    DecDat = 0x05,
    AddDat = 0x06,
    SubDat = 0x07,
    MulDat = 0x08,
    DivDat = 0x09,
    BorDat = 0x0a,
    AndDat = 0x0b,
    XorDat = 0x0c,
    NotDat = 0x0d,
    SetInd = 0x0e,
    SetIdx = 0x0f,
    PshDat = 0x10,
    PopDat = 0x11,
    JmpSub = 0x12,
    RetSub = 0x13,
    IndDat = 0x14,
    IdxDat = 0x15,
    ModDat = 0x16,
    ShlDat = 0x17,
    ShrDat = 0x18,
    JmpAdr = 0x1a,
    Bzr = 0x1b,
    Bnz = 0x1e,
    Bgt = 0x1f,
    Blt = 0x20,
    Bge = 0x21,
    Ble = 0x22,
    Beq = 0x23,
    Bne = 0x24,
    SlpDat = 0x25,
    FizDat = 0x26,
    StzDat = 0x27,
    FinImd = 0x28,
    StpImd = 0x29,
    SlpImd = 0x2a,
    ErrAdr = 0x2b,
    SetPcs = 0x30,
    ExtFun = 0x32,
    ExtFunDat = 0x33,
    ExtFunDat2 = 0x34,
    ExtFunRet = 0x35,
    ExtFunRetDat = 0x36,
    ExtFunRetDat2 = 0x37,
    Nop = 0x7f,
}

impl OpCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        use OpCode::*;

        Some(match value {
            0x01 => SetVal,
            0x02 => SetDat,
            0x03 => ClrDat,
            0x04 => IncDat,
            0x05 => DecDat,
            0x06 => AddDat,
            0x07 => SubDat,
            0x08 => MulDat,
            0x09 => DivDat,
            0x0a => BorDat,
            0x0b => AndDat,
            0x0c => XorDat,
            0x0d => NotDat,
            0x0e => SetInd,
            0x0f => SetIdx,
            0x10 => PshDat,
            0x11 => PopDat,
            0x12 => JmpSub,
            0x13 => RetSub,
            0x14 => IndDat,
            0x15 => IdxDat,
            0x16 => ModDat,
            0x17 => ShlDat,
            0x18 => ShrDat,
            0x1a => JmpAdr,
            0x1b => Bzr,
            0x1e => Bnz,
            0x1f => Bgt,
            0x20 => Blt,
            0x21 => Bge,
            0x22 => Ble,
            0x23 => Beq,
            0x24 => Bne,
            0x25 => SlpDat,
            0x26 => FizDat,
            0x27 => StzDat,
            0x28 => FinImd,
            0x29 => StpImd,
            0x2a => SlpImd,
            0x2b => ErrAdr,
            0x30 => SetPcs,
            0x32 => ExtFun,
            0x33 => ExtFunDat,
            0x34 => ExtFunDat2,
            0x35 => ExtFunRet,
            0x36 => ExtFunRetDat,
            0x37 => ExtFunRetDat2,
            0x7f => Nop,
            _ => return None,
        })
    }

    /// Step cost. Only the EXT_FUN family is surcharged; every other
    /// opcode costs a single step.
    #[must_use]
    pub fn steps(self, settings: &AtSettings) -> u32 {
        let value = self as u8;

        if value >= OpCode::ExtFun as u8 && value <= OpCode::ExtFunRetDat2 as u8 {
            settings.steps_per_function_call
        } else {
            1
        }
    }
}

/// Machine-local function codes, resolved without touching the chain.
mod fun {
    pub const GET_A1: u16 = 0x0100;
    pub const GET_A2: u16 = 0x0101;
    pub const GET_A3: u16 = 0x0102;
    pub const GET_A4: u16 = 0x0103;
    pub const GET_B1: u16 = 0x0104;
    pub const GET_B2: u16 = 0x0105;
    pub const GET_B3: u16 = 0x0106;
    pub const GET_B4: u16 = 0x0107;
    pub const SET_A1: u16 = 0x0110;
    pub const SET_A2: u16 = 0x0111;
    pub const SET_A3: u16 = 0x0112;
    pub const SET_A4: u16 = 0x0113;
    pub const SET_A1_A2: u16 = 0x0114;
    pub const SET_A3_A4: u16 = 0x0115;
    pub const SET_B1: u16 = 0x0116;
    pub const SET_B2: u16 = 0x0117;
    pub const SET_B3: u16 = 0x0118;
    pub const SET_B4: u16 = 0x0119;
    pub const SET_B1_B2: u16 = 0x011a;
    pub const SET_B3_B4: u16 = 0x011b;
    pub const CLR_A: u16 = 0x0120;
    pub const CLR_B: u16 = 0x0121;
    pub const CLR_A_AND_B: u16 = 0x0122;
    pub const COPY_A_FROM_B: u16 = 0x0123;
    pub const COPY_B_FROM_A: u16 = 0x0124;
    pub const CHECK_A_IS_ZERO: u16 = 0x0125;
    pub const CHECK_B_IS_ZERO: u16 = 0x0126;
    pub const CHECK_A_EQUALS_B: u16 = 0x0127;
    pub const SWAP_A_AND_B: u16 = 0x0128;
    pub const OR_A_WITH_B: u16 = 0x0129;
    pub const OR_B_WITH_A: u16 = 0x012a;
    pub const AND_A_WITH_B: u16 = 0x012b;
    pub const AND_B_WITH_A: u16 = 0x012c;
    pub const XOR_A_WITH_B: u16 = 0x012d;
    pub const XOR_B_WITH_A: u16 = 0x012e;
}

/// Platform function codes, dispatched through `PlatformApi`.
pub mod platform_fun {
    pub const GET_BLOCK_TIMESTAMP: u16 = 0x0300;
    pub const GET_CREATION_TIMESTAMP: u16 = 0x0301;
    pub const GET_LAST_BLOCK_TIMESTAMP: u16 = 0x0302;
    pub const PUT_LAST_BLOCK_HASH_IN_A: u16 = 0x0303;
    pub const A_TO_TX_AFTER_TIMESTAMP: u16 = 0x0304;
    pub const GET_TYPE_FOR_TX_IN_A: u16 = 0x0305;
    pub const GET_AMOUNT_FOR_TX_IN_A: u16 = 0x0306;
    pub const GET_TIMESTAMP_FOR_TX_IN_A: u16 = 0x0307;
    pub const GET_RANDOM_ID_FOR_TX_IN_A: u16 = 0x0308;
    pub const MESSAGE_FROM_TX_IN_A_TO_B: u16 = 0x0309;
    pub const B_TO_ADDRESS_OF_TX_IN_A: u16 = 0x030a;
    pub const B_TO_ADDRESS_OF_CREATOR: u16 = 0x030b;
    pub const GET_CURRENT_BALANCE: u16 = 0x0400;
    pub const GET_PREVIOUS_BALANCE: u16 = 0x0401;
    pub const SEND_TO_ADDRESS_IN_B: u16 = 0x0402;
    pub const SEND_ALL_TO_ADDRESS_IN_B: u16 = 0x0403;
    pub const SEND_OLD_TO_ADDRESS_IN_B: u16 = 0x0404;
    pub const SEND_A_TO_ADDRESS_IN_B: u16 = 0x0405;
    pub const ADD_MINUTES_TO_TIMESTAMP: u16 = 0x0406;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionErr {
    /// Unknown opcode byte
    InvalidOpCode(u8),

    /// Jump or fetch outside the code segment
    InvalidCodeAddress(u32),

    /// Data access outside the data segment
    InvalidDataAddress(u32),

    /// Unknown or malformed function call
    InvalidFunctionCode(u16),

    /// User or call stack exceeded its depth limit
    StackOverflow,

    /// Pop or return from an empty stack
    StackUnderflow,

    /// Division or modulo by zero
    DivisionByZero,

    /// Step budget for the round exhausted. Never recoverable.
    StepBudgetExceeded,
}

/// Callback surface the VM sees. Implementations must be infallible from
/// the VM's perspective: failures become machine flags or sentinel values,
/// never unwinds (deterministic consensus cannot tolerate host-dependent
/// exception flow).
pub trait PlatformApi {
    fn current_block_height(&mut self) -> u32;
    fn at_creation_block_height(&mut self, state: &mut MachineState) -> u32;
    fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState);
    fn put_transaction_after_timestamp_into_a(&mut self, ts: Timestamp, state: &mut MachineState);
    fn type_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64;
    fn amount_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64;
    fn timestamp_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64;
    fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> u64;
    fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState);
    fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState);
    fn put_creator_address_into_b(&mut self, state: &mut MachineState);
    fn current_balance(&mut self, state: &mut MachineState) -> u64;
    fn previous_balance(&mut self, state: &mut MachineState) -> u64;
    fn pay_amount_to_b(&mut self, amount: u64, state: &mut MachineState);
    fn message_a_to_b(&mut self, state: &mut MachineState);
    fn add_minutes_to_timestamp(&mut self, ts: Timestamp, minutes: u64) -> u64;
    fn on_finished(&mut self, balance: u64, state: &mut MachineState);
    fn on_fatal_error(&mut self, state: &MachineState, err: ExecutionErr);
}

/// One AT's execution state. Reconstituted from the persisted blob at the
/// start of each round and re-serialised at the end; the A/B scratch
/// registers and stacks do not survive between rounds except through the
/// blob's A/B lanes.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineState {
    code: Vec<u8>,
    data: Vec<u8>,
    a: [u64; 4],
    b: [u64; 4],
    pc: u32,
    stopped: bool,
    finished: bool,
    frozen: bool,
    sleeping: bool,
    fatal: bool,
    first_op_after_sleep: bool,
    steps: u32,
    sleep_until_height: u32,
    previous_balance: Money,

    // Round-scoped, never serialised
    current_balance: Money,
    user_stack: Vec<u64>,
    call_stack: Vec<u32>,
    error_handler: Option<u32>,
    pcs: u32,
}

impl MachineState {
    pub fn new(code: Vec<u8>, data_size: usize) -> Result<Self, &'static str> {
        if code.is_empty() || code.len() > MAX_CODE_SIZE {
            return Err("invalid bytecode segment size");
        }

        if data_size % 8 != 0 || data_size > MAX_DATA_SIZE {
            return Err("invalid data segment size");
        }

        Ok(Self {
            code,
            data: vec![0; data_size],
            a: [0; 4],
            b: [0; 4],
            pc: 0,
            stopped: false,
            finished: false,
            frozen: false,
            sleeping: false,
            fatal: false,
            first_op_after_sleep: false,
            steps: 0,
            sleep_until_height: 0,
            previous_balance: 0,
            current_balance: 0,
            user_stack: Vec::new(),
            call_stack: Vec::new(),
            error_handler: None,
            pcs: 0,
        })
    }

    // Register and flag accessors used by the platform API

    #[must_use]
    pub fn a1(&self) -> u64 {
        self.a[0]
    }

    pub fn set_a1(&mut self, v: u64) {
        self.a[0] = v;
    }

    pub fn set_a2(&mut self, v: u64) {
        self.a[1] = v;
    }

    pub fn set_a3(&mut self, v: u64) {
        self.a[2] = v;
    }

    pub fn set_a4(&mut self, v: u64) {
        self.a[3] = v;
    }

    #[must_use]
    pub fn a2(&self) -> u64 {
        self.a[1]
    }

    #[must_use]
    pub fn a3(&self) -> u64 {
        self.a[2]
    }

    #[must_use]
    pub fn a4(&self) -> u64 {
        self.a[3]
    }

    pub fn zero_a(&mut self) {
        self.a = [0; 4];
    }

    pub fn zero_b(&mut self) {
        self.b = [0; 4];
    }

    /// A as 32 bytes, lanes packed little-endian.
    #[must_use]
    pub fn a_bytes(&self) -> [u8; 32] {
        lanes_to_bytes(&self.a)
    }

    /// B as 32 bytes, lanes packed little-endian.
    #[must_use]
    pub fn b_bytes(&self) -> [u8; 32] {
        lanes_to_bytes(&self.b)
    }

    pub fn set_b_bytes(&mut self, bytes: &[u8; 32]) {
        self.b = bytes_to_lanes(bytes);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn set_fatal(&mut self) {
        self.fatal = true;
    }

    #[must_use]
    pub fn sleep_until_height(&self) -> u32 {
        self.sleep_until_height
    }

    /// Suspends the machine until the given block height.
    pub fn sleep_until(&mut self, height: u32) {
        self.sleeping = true;
        self.sleep_until_height = height;
    }

    /// Clears the sleeping state. The next executed instruction observes
    /// `is_first_op_after_sleeping`, which is how the two-phase random
    /// function detects its second call.
    pub fn wake(&mut self) {
        self.sleeping = false;
        self.sleep_until_height = 0;
        self.first_op_after_sleep = true;
    }

    #[must_use]
    pub fn is_first_op_after_sleeping(&self) -> bool {
        self.first_op_after_sleep
    }

    #[must_use]
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Resets the per-round step counter.
    pub fn reset_steps(&mut self) {
        self.steps = 0;
    }

    #[must_use]
    pub fn previous_balance(&self) -> Money {
        self.previous_balance
    }

    pub fn set_previous_balance(&mut self, balance: Money) {
        self.previous_balance = balance;
    }

    #[must_use]
    pub fn current_balance(&self) -> Money {
        self.current_balance
    }

    pub fn set_current_balance(&mut self, balance: Money) {
        self.current_balance = balance;
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Reads the data-segment word at a word-indexed address. Test and
    /// tooling accessor; the VM itself goes through `get_data`.
    pub fn data_word(&self, addr: u32) -> Option<u64> {
        self.get_data(addr).ok()
    }

    /// Writes a data-segment word. Used when seeding deployment data.
    pub fn set_data_word(&mut self, addr: u32, value: u64) -> Result<(), &'static str> {
        self.put_data(addr, value)
            .map_err(|_| "data address out of bounds")
    }

    // Consensus state-blob codec.
    //
    // Layout (all integers little-endian):
    //   codeLen u32 | code | dataLen u32 | data | A[4 x u64] | B[4 x u64] |
    //   pc u32 | flags u8 | stepsUsed u32 | sleepUntilHeight u32 |
    //   previousBalance u64

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.code.len() + 4 + self.data.len() + 85);

        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);

        for lane in &self.a {
            out.extend_from_slice(&lane.to_le_bytes());
        }
        for lane in &self.b {
            out.extend_from_slice(&lane.to_le_bytes());
        }

        out.extend_from_slice(&self.pc.to_le_bytes());
        out.push(self.flags());
        out.extend_from_slice(&self.steps.to_le_bytes());
        out.extend_from_slice(&self.sleep_until_height.to_le_bytes());
        out.extend_from_slice(&self.previous_balance.to_le_bytes());

        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, &'static str> {
        let mut reader = LeReader::new(bytes);
        let err = "corrupt machine state blob";

        let code_len = reader.read_u32().ok_or(err)? as usize;
        if code_len > MAX_CODE_SIZE {
            return Err(err);
        }
        let code = reader.read_bytes(code_len).ok_or(err)?.to_vec();

        let data_len = reader.read_u32().ok_or(err)? as usize;
        if data_len > MAX_DATA_SIZE {
            return Err(err);
        }
        let data = reader.read_bytes(data_len).ok_or(err)?.to_vec();

        let mut a = [0u64; 4];
        for lane in &mut a {
            *lane = reader.read_u64().ok_or(err)?;
        }
        let mut b = [0u64; 4];
        for lane in &mut b {
            *lane = reader.read_u64().ok_or(err)?;
        }

        let pc = reader.read_u32().ok_or(err)?;
        let flags = reader.read_u8().ok_or(err)?;
        let steps = reader.read_u32().ok_or(err)?;
        let sleep_until_height = reader.read_u32().ok_or(err)?;
        let previous_balance = reader.read_u64().ok_or(err)?;

        if !reader.is_exhausted() {
            return Err(err);
        }

        Ok(Self {
            code,
            data,
            a,
            b,
            pc,
            stopped: flags & FLAG_STOPPED != 0,
            finished: flags & FLAG_FINISHED != 0,
            frozen: flags & FLAG_FROZEN != 0,
            sleeping: flags & FLAG_SLEEPING != 0,
            fatal: flags & FLAG_FATAL != 0,
            first_op_after_sleep: flags & FLAG_FIRST_AFTER_SLEEP != 0,
            steps,
            sleep_until_height,
            previous_balance,
            current_balance: 0,
            user_stack: Vec::new(),
            call_stack: Vec::new(),
            error_handler: None,
            pcs: 0,
        })
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.stopped {
            flags |= FLAG_STOPPED;
        }
        if self.finished {
            flags |= FLAG_FINISHED;
        }
        if self.frozen {
            flags |= FLAG_FROZEN;
        }
        if self.sleeping {
            flags |= FLAG_SLEEPING;
        }
        if self.fatal {
            flags |= FLAG_FATAL;
        }
        if self.first_op_after_sleep {
            flags |= FLAG_FIRST_AFTER_SLEEP;
        }
        flags
    }

    /// Whether another instruction may execute.
    #[must_use]
    pub fn can_run(&self) -> bool {
        !(self.stopped || self.finished || self.frozen || self.sleeping || self.fatal)
    }

    /// Runs until suspension or until the round's step budget is spent.
    pub fn run(&mut self, api: &mut dyn PlatformApi, settings: &AtSettings) {
        while self.can_run() {
            if let Err(err) = self.step(api, settings) {
                self.handle_error(api, err);
            }
        }
    }

    /// Executes a single instruction.
    pub fn step(
        &mut self,
        api: &mut dyn PlatformApi,
        settings: &AtSettings,
    ) -> Result<(), ExecutionErr> {
        let pc = self.pc;
        let opcode_byte = self.fetch_u8(pc)?;
        let opcode = OpCode::from_u8(opcode_byte).ok_or(ExecutionErr::InvalidOpCode(opcode_byte))?;

        let cost = opcode.steps(settings);
        if self.steps.saturating_add(cost) > settings.max_steps_per_round {
            return Err(ExecutionErr::StepBudgetExceeded);
        }
        self.steps += cost;

        self.exec(opcode, pc, api)?;
        self.first_op_after_sleep = false;

        Ok(())
    }

    fn handle_error(&mut self, api: &mut dyn PlatformApi, err: ExecutionErr) {
        // A declared error handler catches code errors; budget overrun is
        // always fatal.
        if err != ExecutionErr::StepBudgetExceeded {
            if let Some(handler) = self.error_handler {
                self.pc = handler;
                return;
            }
        }

        self.fatal = true;
        api.on_fatal_error(self, err);
    }

    fn exec(&mut self, opcode: OpCode, pc: u32, api: &mut dyn PlatformApi) -> Result<(), ExecutionErr> {
        use OpCode::*;

        match opcode {
            Nop => self.pc = pc + 1,

            SetVal => {
                let dst = self.fetch_u32(pc + 1)?;
                let imm = self.fetch_u64(pc + 5)?;
                self.put_data(dst, imm)?;
                self.pc = pc + 13;
            }

            SetDat => {
                let (dst, src) = (self.fetch_u32(pc + 1)?, self.fetch_u32(pc + 5)?);
                let v = self.get_data(src)?;
                self.put_data(dst, v)?;
                self.pc = pc + 9;
            }

            ClrDat => {
                let dst = self.fetch_u32(pc + 1)?;
                self.put_data(dst, 0)?;
                self.pc = pc + 5;
            }

            IncDat => {
                let dst = self.fetch_u32(pc + 1)?;
                let v = self.get_data(dst)?;
                self.put_data(dst, v.wrapping_add(1))?;
                self.pc = pc + 5;
            }

            DecDat => {
                let dst = self.fetch_u32(pc + 1)?;
                let v = self.get_data(dst)?;
                self.put_data(dst, v.wrapping_sub(1))?;
                self.pc = pc + 5;
            }

            AddDat | SubDat | MulDat | DivDat | BorDat | AndDat | XorDat | ModDat | ShlDat
            | ShrDat => {
                let (dst, src) = (self.fetch_u32(pc + 1)?, self.fetch_u32(pc + 5)?);
                let lhs = self.get_data(dst)?;
                let rhs = self.get_data(src)?;

                let result = match opcode {
                    AddDat => lhs.wrapping_add(rhs),
                    SubDat => lhs.wrapping_sub(rhs),
                    MulDat => lhs.wrapping_mul(rhs),
                    DivDat => {
                        if rhs == 0 {
                            return Err(ExecutionErr::DivisionByZero);
                        }
                        ((lhs as i64).wrapping_div(rhs as i64)) as u64
                    }
                    ModDat => {
                        if rhs == 0 {
                            return Err(ExecutionErr::DivisionByZero);
                        }
                        ((lhs as i64).wrapping_rem(rhs as i64)) as u64
                    }
                    BorDat => lhs | rhs,
                    AndDat => lhs & rhs,
                    XorDat => lhs ^ rhs,
                    ShlDat => {
                        if rhs > 63 {
                            0
                        } else {
                            lhs << rhs
                        }
                    }
                    ShrDat => {
                        if rhs > 63 {
                            0
                        } else {
                            lhs >> rhs
                        }
                    }
                    _ => unreachable!(),
                };

                self.put_data(dst, result)?;
                self.pc = pc + 9;
            }

            NotDat => {
                let dst = self.fetch_u32(pc + 1)?;
                let v = self.get_data(dst)?;
                self.put_data(dst, !v)?;
                self.pc = pc + 5;
            }

            SetInd => {
                let (dst, ind) = (self.fetch_u32(pc + 1)?, self.fetch_u32(pc + 5)?);
                let addr = self.get_data(ind)?;
                let v = self.get_data(word_addr(addr)?)?;
                self.put_data(dst, v)?;
                self.pc = pc + 9;
            }

            SetIdx => {
                let dst = self.fetch_u32(pc + 1)?;
                let ind = self.fetch_u32(pc + 5)?;
                let idx = self.fetch_u32(pc + 9)?;
                let base = self.get_data(ind)?;
                let offset = self.get_data(idx)?;
                let addr = word_addr(base.wrapping_add(offset))?;
                let v = self.get_data(addr)?;
                self.put_data(dst, v)?;
                self.pc = pc + 13;
            }

            IndDat => {
                let (ind, src) = (self.fetch_u32(pc + 1)?, self.fetch_u32(pc + 5)?);
                let addr = self.get_data(ind)?;
                let v = self.get_data(src)?;
                self.put_data(word_addr(addr)?, v)?;
                self.pc = pc + 9;
            }

            IdxDat => {
                let ind = self.fetch_u32(pc + 1)?;
                let idx = self.fetch_u32(pc + 5)?;
                let src = self.fetch_u32(pc + 9)?;
                let base = self.get_data(ind)?;
                let offset = self.get_data(idx)?;
                let v = self.get_data(src)?;
                self.put_data(word_addr(base.wrapping_add(offset))?, v)?;
                self.pc = pc + 13;
            }

            PshDat => {
                let src = self.fetch_u32(pc + 1)?;
                if self.user_stack.len() >= STACK_SIZE {
                    return Err(ExecutionErr::StackOverflow);
                }
                let v = self.get_data(src)?;
                self.user_stack.push(v);
                self.pc = pc + 5;
            }

            PopDat => {
                let dst = self.fetch_u32(pc + 1)?;
                let v = self.user_stack.pop().ok_or(ExecutionErr::StackUnderflow)?;
                self.put_data(dst, v)?;
                self.pc = pc + 5;
            }

            JmpSub => {
                let target = self.fetch_u32(pc + 1)?;
                self.check_code_addr(target)?;
                if self.call_stack.len() >= STACK_SIZE {
                    return Err(ExecutionErr::StackOverflow);
                }
                self.call_stack.push(pc + 5);
                self.pc = target;
            }

            RetSub => {
                let ret = self.call_stack.pop().ok_or(ExecutionErr::StackUnderflow)?;
                self.pc = ret;
            }

            JmpAdr => {
                let target = self.fetch_u32(pc + 1)?;
                self.check_code_addr(target)?;
                self.pc = target;
            }

            Bzr | Bnz => {
                let src = self.fetch_u32(pc + 1)?;
                let offset = self.fetch_u8(pc + 5)? as i8;
                let v = self.get_data(src)?;
                let jump = (opcode == Bzr) == (v == 0);

                if jump {
                    self.branch(pc, offset)?;
                } else {
                    self.pc = pc + 6;
                }
            }

            Bgt | Blt | Bge | Ble | Beq | Bne => {
                let a = self.fetch_u32(pc + 1)?;
                let b = self.fetch_u32(pc + 5)?;
                let offset = self.fetch_u8(pc + 9)? as i8;
                let lhs = self.get_data(a)? as i64;
                let rhs = self.get_data(b)? as i64;

                let jump = match opcode {
                    Bgt => lhs > rhs,
                    Blt => lhs < rhs,
                    Bge => lhs >= rhs,
                    Ble => lhs <= rhs,
                    Beq => lhs == rhs,
                    Bne => lhs != rhs,
                    _ => unreachable!(),
                };

                if jump {
                    self.branch(pc, offset)?;
                } else {
                    self.pc = pc + 10;
                }
            }

            SlpDat => {
                let src = self.fetch_u32(pc + 1)?;
                let v = self.get_data(src)?;
                self.pc = pc + 5;
                // The value is a packed timestamp; the height lane selects
                // the wake-up block
                self.sleep_until(Timestamp::unpack(v).height);
            }

            SlpImd => {
                self.pc = pc + 1;
                let height = api.current_block_height() + 1;
                self.sleep_until(height);
            }

            FizDat => {
                let src = self.fetch_u32(pc + 1)?;
                let v = self.get_data(src)?;
                self.pc = pc + 5;
                if v == 0 {
                    self.finished = true;
                }
            }

            StzDat => {
                let src = self.fetch_u32(pc + 1)?;
                let v = self.get_data(src)?;
                self.pc = pc + 5;
                if v == 0 {
                    self.stopped = true;
                    self.pc = self.pcs;
                }
            }

            FinImd => {
                self.pc = pc + 1;
                self.finished = true;
            }

            StpImd => {
                self.pc = pc + 1;
                self.stopped = true;
                self.pc = self.pcs;
            }

            ErrAdr => {
                let target = self.fetch_u32(pc + 1)?;
                self.check_code_addr(target)?;
                self.error_handler = Some(target);
                self.pc = pc + 5;
            }

            SetPcs => {
                self.pc = pc + 1;
                self.pcs = self.pc;
            }

            ExtFun => {
                let fun_code = self.fetch_u16(pc + 1)?;
                self.call_function(api, fun_code, &[], None, pc, pc + 3)?;
            }

            ExtFunDat => {
                let fun_code = self.fetch_u16(pc + 1)?;
                let src = self.fetch_u32(pc + 3)?;
                let arg = self.get_data(src)?;
                self.call_function(api, fun_code, &[arg], None, pc, pc + 7)?;
            }

            ExtFunDat2 => {
                let fun_code = self.fetch_u16(pc + 1)?;
                let src1 = self.fetch_u32(pc + 3)?;
                let src2 = self.fetch_u32(pc + 7)?;
                let arg1 = self.get_data(src1)?;
                let arg2 = self.get_data(src2)?;
                self.call_function(api, fun_code, &[arg1, arg2], None, pc, pc + 11)?;
            }

            ExtFunRet => {
                let fun_code = self.fetch_u16(pc + 1)?;
                let dst = self.fetch_u32(pc + 3)?;
                self.check_data_addr(dst)?;
                self.call_function(api, fun_code, &[], Some(dst), pc, pc + 7)?;
            }

            ExtFunRetDat => {
                let fun_code = self.fetch_u16(pc + 1)?;
                let dst = self.fetch_u32(pc + 3)?;
                let src = self.fetch_u32(pc + 7)?;
                self.check_data_addr(dst)?;
                let arg = self.get_data(src)?;
                self.call_function(api, fun_code, &[arg], Some(dst), pc, pc + 11)?;
            }

            ExtFunRetDat2 => {
                let fun_code = self.fetch_u16(pc + 1)?;
                let dst = self.fetch_u32(pc + 3)?;
                let src1 = self.fetch_u32(pc + 7)?;
                let src2 = self.fetch_u32(pc + 11)?;
                self.check_data_addr(dst)?;
                let arg1 = self.get_data(src1)?;
                let arg2 = self.get_data(src2)?;
                self.call_function(api, fun_code, &[arg1, arg2], Some(dst), pc, pc + 15)?;
            }
        }

        Ok(())
    }

    /// Dispatches a function call. A call that puts the machine to sleep
    /// does not advance the pc: the same instruction re-executes on wake,
    /// which is how two-phase functions deliver their real result.
    fn call_function(
        &mut self,
        api: &mut dyn PlatformApi,
        fun_code: u16,
        args: &[u64],
        ret: Option<u32>,
        pc: u32,
        next_pc: u32,
    ) -> Result<(), ExecutionErr> {
        let was_sleeping = self.sleeping;
        let result = self.dispatch_function(api, fun_code, args)?;

        if !was_sleeping && self.sleeping {
            self.pc = pc;
            return Ok(());
        }

        if let (Some(dst), Some(value)) = (ret, result) {
            self.put_data(dst, value)?;
        }

        self.pc = next_pc;
        Ok(())
    }

    fn dispatch_function(
        &mut self,
        api: &mut dyn PlatformApi,
        fun_code: u16,
        args: &[u64],
    ) -> Result<Option<u64>, ExecutionErr> {
        use platform_fun::*;

        let bad = ExecutionErr::InvalidFunctionCode(fun_code);

        let value = match (fun_code, args.len()) {
            (fun::GET_A1, 0) => Some(self.a[0]),
            (fun::GET_A2, 0) => Some(self.a[1]),
            (fun::GET_A3, 0) => Some(self.a[2]),
            (fun::GET_A4, 0) => Some(self.a[3]),
            (fun::GET_B1, 0) => Some(self.b[0]),
            (fun::GET_B2, 0) => Some(self.b[1]),
            (fun::GET_B3, 0) => Some(self.b[2]),
            (fun::GET_B4, 0) => Some(self.b[3]),

            (fun::SET_A1, 1) => {
                self.a[0] = args[0];
                None
            }
            (fun::SET_A2, 1) => {
                self.a[1] = args[0];
                None
            }
            (fun::SET_A3, 1) => {
                self.a[2] = args[0];
                None
            }
            (fun::SET_A4, 1) => {
                self.a[3] = args[0];
                None
            }
            (fun::SET_A1_A2, 2) => {
                self.a[0] = args[0];
                self.a[1] = args[1];
                None
            }
            (fun::SET_A3_A4, 2) => {
                self.a[2] = args[0];
                self.a[3] = args[1];
                None
            }
            (fun::SET_B1, 1) => {
                self.b[0] = args[0];
                None
            }
            (fun::SET_B2, 1) => {
                self.b[1] = args[0];
                None
            }
            (fun::SET_B3, 1) => {
                self.b[2] = args[0];
                None
            }
            (fun::SET_B4, 1) => {
                self.b[3] = args[0];
                None
            }
            (fun::SET_B1_B2, 2) => {
                self.b[0] = args[0];
                self.b[1] = args[1];
                None
            }
            (fun::SET_B3_B4, 2) => {
                self.b[2] = args[0];
                self.b[3] = args[1];
                None
            }

            (fun::CLR_A, 0) => {
                self.zero_a();
                None
            }
            (fun::CLR_B, 0) => {
                self.zero_b();
                None
            }
            (fun::CLR_A_AND_B, 0) => {
                self.zero_a();
                self.zero_b();
                None
            }
            (fun::COPY_A_FROM_B, 0) => {
                self.a = self.b;
                None
            }
            (fun::COPY_B_FROM_A, 0) => {
                self.b = self.a;
                None
            }
            (fun::CHECK_A_IS_ZERO, 0) => Some(u64::from(self.a == [0; 4])),
            (fun::CHECK_B_IS_ZERO, 0) => Some(u64::from(self.b == [0; 4])),
            (fun::CHECK_A_EQUALS_B, 0) => Some(u64::from(self.a == self.b)),
            (fun::SWAP_A_AND_B, 0) => {
                std::mem::swap(&mut self.a, &mut self.b);
                None
            }
            (fun::OR_A_WITH_B, 0) => {
                for i in 0..4 {
                    self.a[i] |= self.b[i];
                }
                None
            }
            (fun::OR_B_WITH_A, 0) => {
                for i in 0..4 {
                    self.b[i] |= self.a[i];
                }
                None
            }
            (fun::AND_A_WITH_B, 0) => {
                for i in 0..4 {
                    self.a[i] &= self.b[i];
                }
                None
            }
            (fun::AND_B_WITH_A, 0) => {
                for i in 0..4 {
                    self.b[i] &= self.a[i];
                }
                None
            }
            (fun::XOR_A_WITH_B, 0) => {
                for i in 0..4 {
                    self.a[i] ^= self.b[i];
                }
                None
            }
            (fun::XOR_B_WITH_A, 0) => {
                for i in 0..4 {
                    self.b[i] ^= self.a[i];
                }
                None
            }

            (GET_BLOCK_TIMESTAMP, 0) => {
                Some(Timestamp::new(api.current_block_height(), 0).pack())
            }
            (GET_CREATION_TIMESTAMP, 0) => {
                Some(Timestamp::new(api.at_creation_block_height(self), 0).pack())
            }
            (GET_LAST_BLOCK_TIMESTAMP, 0) => {
                let height = api.current_block_height().saturating_sub(1);
                Some(Timestamp::new(height, 0).pack())
            }
            (PUT_LAST_BLOCK_HASH_IN_A, 0) => {
                api.put_previous_block_hash_into_a(self);
                None
            }
            (A_TO_TX_AFTER_TIMESTAMP, 1) => {
                api.put_transaction_after_timestamp_into_a(Timestamp::unpack(args[0]), self);
                None
            }
            (GET_TYPE_FOR_TX_IN_A, 0) => Some(api.type_from_transaction_in_a(self)),
            (GET_AMOUNT_FOR_TX_IN_A, 0) => Some(api.amount_from_transaction_in_a(self)),
            (GET_TIMESTAMP_FOR_TX_IN_A, 0) => Some(api.timestamp_from_transaction_in_a(self)),
            (GET_RANDOM_ID_FOR_TX_IN_A, 0) => {
                Some(api.generate_random_using_transaction_in_a(self))
            }
            (MESSAGE_FROM_TX_IN_A_TO_B, 0) => {
                api.put_message_from_transaction_in_a_into_b(self);
                None
            }
            (B_TO_ADDRESS_OF_TX_IN_A, 0) => {
                api.put_address_from_transaction_in_a_into_b(self);
                None
            }
            (B_TO_ADDRESS_OF_CREATOR, 0) => {
                api.put_creator_address_into_b(self);
                None
            }

            (GET_CURRENT_BALANCE, 0) => Some(api.current_balance(self)),
            (GET_PREVIOUS_BALANCE, 0) => Some(api.previous_balance(self)),
            (SEND_TO_ADDRESS_IN_B, 1) => {
                api.pay_amount_to_b(args[0], self);
                None
            }
            (SEND_ALL_TO_ADDRESS_IN_B, 0) => {
                let balance = api.current_balance(self);
                api.pay_amount_to_b(balance, self);
                None
            }
            (SEND_OLD_TO_ADDRESS_IN_B, 0) => {
                let balance = api.previous_balance(self);
                api.pay_amount_to_b(balance, self);
                None
            }
            (SEND_A_TO_ADDRESS_IN_B, 0) => {
                api.message_a_to_b(self);
                None
            }
            (ADD_MINUTES_TO_TIMESTAMP, 2) => {
                Some(api.add_minutes_to_timestamp(Timestamp::unpack(args[0]), args[1]))
            }

            _ => return Err(bad),
        };

        Ok(value)
    }

    fn branch(&mut self, pc: u32, offset: i8) -> Result<(), ExecutionErr> {
        let target = pc as i64 + i64::from(offset);
        if target < 0 || target as usize >= self.code.len() {
            return Err(ExecutionErr::InvalidCodeAddress(target as u32));
        }
        self.pc = target as u32;
        Ok(())
    }

    fn fetch_u8(&self, addr: u32) -> Result<u8, ExecutionErr> {
        self.code
            .get(addr as usize)
            .copied()
            .ok_or(ExecutionErr::InvalidCodeAddress(addr))
    }

    fn fetch_u16(&self, addr: u32) -> Result<u16, ExecutionErr> {
        let i = addr as usize;
        if i + 2 > self.code.len() {
            return Err(ExecutionErr::InvalidCodeAddress(addr));
        }
        Ok(u16::from_le_bytes([self.code[i], self.code[i + 1]]))
    }

    fn fetch_u32(&self, addr: u32) -> Result<u32, ExecutionErr> {
        let i = addr as usize;
        if i + 4 > self.code.len() {
            return Err(ExecutionErr::InvalidCodeAddress(addr));
        }
        Ok(crate::codec::u32_from_le(&self.code, i))
    }

    fn fetch_u64(&self, addr: u32) -> Result<u64, ExecutionErr> {
        let i = addr as usize;
        if i + 8 > self.code.len() {
            return Err(ExecutionErr::InvalidCodeAddress(addr));
        }
        Ok(crate::codec::u64_from_le(&self.code, i))
    }

    fn check_code_addr(&self, addr: u32) -> Result<(), ExecutionErr> {
        if (addr as usize) < self.code.len() {
            Ok(())
        } else {
            Err(ExecutionErr::InvalidCodeAddress(addr))
        }
    }

    fn check_data_addr(&self, addr: u32) -> Result<(), ExecutionErr> {
        let i = addr as usize * 8;
        if i + 8 <= self.data.len() {
            Ok(())
        } else {
            Err(ExecutionErr::InvalidDataAddress(addr))
        }
    }

    /// Reads the word at a word-indexed data address.
    fn get_data(&self, addr: u32) -> Result<u64, ExecutionErr> {
        self.check_data_addr(addr)?;
        Ok(crate::codec::u64_from_le(&self.data, addr as usize * 8))
    }

    fn put_data(&mut self, addr: u32, value: u64) -> Result<(), ExecutionErr> {
        self.check_data_addr(addr)?;
        crate::codec::put_u64_le(&mut self.data, addr as usize * 8, value);
        Ok(())
    }
}

fn word_addr(value: u64) -> Result<u32, ExecutionErr> {
    u32::try_from(value).map_err(|_| ExecutionErr::InvalidDataAddress(u32::MAX))
}

fn lanes_to_bytes(lanes: &[u64; 4]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, lane) in lanes.iter().enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&lane.to_le_bytes());
    }
    out
}

fn bytes_to_lanes(bytes: &[u8; 32]) -> [u64; 4] {
    let mut out = [0u64; 4];
    for (i, lane) in out.iter_mut().enumerate() {
        *lane = crate::codec::u64_from_le(bytes, i * 8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Api stub that fails every chain-touching call.
    struct NullApi;

    impl PlatformApi for NullApi {
        fn current_block_height(&mut self) -> u32 {
            10
        }
        fn at_creation_block_height(&mut self, _state: &mut MachineState) -> u32 {
            1
        }
        fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState) {
            state.zero_a();
        }
        fn put_transaction_after_timestamp_into_a(
            &mut self,
            _ts: Timestamp,
            state: &mut MachineState,
        ) {
            state.zero_a();
        }
        fn type_from_transaction_in_a(&mut self, _state: &mut MachineState) -> u64 {
            u64::MAX
        }
        fn amount_from_transaction_in_a(&mut self, _state: &mut MachineState) -> u64 {
            u64::MAX
        }
        fn timestamp_from_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
            state.a1()
        }
        fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
            if !state.is_first_op_after_sleeping() {
                let height = self.current_block_height() + 1;
                state.sleep_until(height);
                return 0;
            }
            0xdead_beef
        }
        fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
            state.zero_b();
        }
        fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
            state.zero_b();
        }
        fn put_creator_address_into_b(&mut self, state: &mut MachineState) {
            state.zero_b();
        }
        fn current_balance(&mut self, state: &mut MachineState) -> u64 {
            state.current_balance()
        }
        fn previous_balance(&mut self, state: &mut MachineState) -> u64 {
            state.previous_balance()
        }
        fn pay_amount_to_b(&mut self, _amount: u64, _state: &mut MachineState) {}
        fn message_a_to_b(&mut self, _state: &mut MachineState) {}
        fn add_minutes_to_timestamp(&mut self, ts: Timestamp, minutes: u64) -> u64 {
            Timestamp::new(ts.height + minutes.max(1) as u32, 0).pack()
        }
        fn on_finished(&mut self, _balance: u64, _state: &mut MachineState) {}
        fn on_fatal_error(&mut self, _state: &MachineState, _err: ExecutionErr) {}
    }

    fn settings() -> AtSettings {
        AtSettings::default()
    }

    fn asm_set_val(code: &mut Vec<u8>, dst: u32, imm: u64) {
        code.push(OpCode::SetVal as u8);
        code.extend_from_slice(&dst.to_le_bytes());
        code.extend_from_slice(&imm.to_le_bytes());
    }

    #[test]
    fn state_blob_round_trip() {
        let mut code = Vec::new();
        asm_set_val(&mut code, 0, 0x1122_3344_5566_7788);
        code.push(OpCode::FinImd as u8);

        let mut machine = MachineState::new(code, 64).unwrap();
        machine.set_a1(1);
        machine.set_a2(2);
        machine.set_b_bytes(&[0xab; 32]);
        machine.sleep_until(17);
        machine.set_previous_balance(12_345);

        let blob = machine.serialize();
        let decoded = MachineState::deserialize(&blob).unwrap();
        assert_eq!(decoded, machine);
        assert_eq!(decoded.serialize(), blob);
    }

    #[test]
    fn deserialize_rejects_truncation_and_trailing_garbage() {
        let machine = MachineState::new(vec![OpCode::FinImd as u8], 8).unwrap();
        let blob = machine.serialize();

        assert!(MachineState::deserialize(&blob[..blob.len() - 1]).is_err());

        let mut extended = blob;
        extended.push(0);
        assert!(MachineState::deserialize(&extended).is_err());
    }

    #[test]
    fn arithmetic_and_branching() {
        // data[0] = 5; data[1] = 3; data[0] += data[1]; if data[0] == data[2] fin else stop
        let mut code = Vec::new();
        asm_set_val(&mut code, 0, 5);
        asm_set_val(&mut code, 1, 3);
        code.push(OpCode::AddDat as u8);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(OpCode::FinImd as u8);

        let mut machine = MachineState::new(code, 32).unwrap();
        machine.run(&mut NullApi, &settings());

        assert!(machine.is_finished());
        assert!(!machine.is_fatal());
        assert_eq!(machine.data_word(0), Some(8));
        assert_eq!(machine.steps(), 4);
    }

    #[test]
    fn step_budget_overrun_is_fatal_with_exact_step_count() {
        // Infinite loop: jump to self
        let mut code = vec![OpCode::JmpAdr as u8];
        code.extend_from_slice(&0u32.to_le_bytes());

        let mut machine = MachineState::new(code, 8).unwrap();
        let settings = AtSettings {
            max_steps_per_round: 100,
            ..AtSettings::default()
        };
        machine.run(&mut NullApi, &settings);

        assert!(machine.is_fatal());
        assert_eq!(machine.steps(), 100);
    }

    #[test]
    fn illegal_opcode_is_fatal_without_error_handler() {
        let mut machine = MachineState::new(vec![0x55], 8).unwrap();
        machine.run(&mut NullApi, &settings());
        assert!(machine.is_fatal());
    }

    #[test]
    fn error_handler_catches_code_errors() {
        // ERR_ADR <handler>; DIV by zero; handler: FIN
        let mut code = Vec::new();
        code.push(OpCode::ErrAdr as u8);
        code.extend_from_slice(&14u32.to_le_bytes());
        code.push(OpCode::DivDat as u8);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(OpCode::FinImd as u8); // offset 14

        let mut machine = MachineState::new(code, 16).unwrap();
        machine.run(&mut NullApi, &settings());

        assert!(machine.is_finished());
        assert!(!machine.is_fatal());
    }

    #[test]
    fn ext_fun_costs_function_call_steps() {
        // EXT_FUN CLR_A; FIN
        let mut code = vec![OpCode::ExtFun as u8];
        code.extend_from_slice(&fun::CLR_A.to_le_bytes());
        code.push(OpCode::FinImd as u8);

        let mut machine = MachineState::new(code, 8).unwrap();
        let s = settings();
        machine.run(&mut NullApi, &s);

        assert_eq!(machine.steps(), s.steps_per_function_call + 1);
    }

    #[test]
    fn register_functions_move_data_between_a_and_b() {
        // data[0]=7; SET_A1 from data[0]; COPY_B_FROM_A; GET_B1 -> data[1]; FIN
        let mut code = Vec::new();
        asm_set_val(&mut code, 0, 7);
        code.push(OpCode::ExtFunDat as u8);
        code.extend_from_slice(&fun::SET_A1.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(OpCode::ExtFun as u8);
        code.extend_from_slice(&fun::COPY_B_FROM_A.to_le_bytes());
        code.push(OpCode::ExtFunRet as u8);
        code.extend_from_slice(&fun::GET_B1.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(OpCode::FinImd as u8);

        let mut machine = MachineState::new(code, 16).unwrap();
        machine.run(&mut NullApi, &settings());

        assert!(machine.is_finished());
        assert_eq!(machine.data_word(1), Some(7));
    }

    #[test]
    fn sleeping_function_reexecutes_on_wake() {
        // EXT_FUN_RET GET_RANDOM -> data[0]; FIN
        let mut code = vec![OpCode::ExtFunRet as u8];
        code.extend_from_slice(&platform_fun::GET_RANDOM_ID_FOR_TX_IN_A.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(OpCode::FinImd as u8);

        let mut machine = MachineState::new(code, 8).unwrap();
        let s = settings();

        machine.run(&mut NullApi, &s);
        assert!(machine.is_sleeping());
        assert_eq!(machine.sleep_until_height(), 11);
        assert_eq!(machine.data_word(0), Some(0));

        // Next round: wake and re-run the same instruction
        machine.wake();
        machine.reset_steps();
        machine.run(&mut NullApi, &s);

        assert!(machine.is_finished());
        assert_eq!(machine.data_word(0), Some(0xdead_beef));
    }

    #[test]
    fn subroutines_push_and_pop_return_addresses() {
        // JMP_SUB 6; FIN; sub: NOP; RET_SUB
        let mut code = Vec::new();
        code.push(OpCode::JmpSub as u8);
        code.extend_from_slice(&6u32.to_le_bytes());
        code.push(OpCode::FinImd as u8); // offset 5
        code.push(OpCode::Nop as u8); // offset 6
        code.push(OpCode::RetSub as u8);

        let mut machine = MachineState::new(code, 8).unwrap();
        machine.run(&mut NullApi, &settings());

        assert!(machine.is_finished());
        assert!(!machine.is_fatal());
    }
}
