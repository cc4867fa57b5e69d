//! The in-process EVM. One instruction appends one register to the per-call
//! pool; ancillary fields (jump destination, branch condition, storage slot,
//! memory offset) are captured from the concrete stack as it runs.
use std::collections::HashSet;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::asm::InstructionIterator;
use crate::evm::arith;
use crate::evm::memory::Memory;
use crate::evm::opcode::OpCode;
use crate::evm::register::RegPool;
use crate::evm::stack::{Stack, STACK_LIMIT};
use crate::evm::state::StateDB;
use crate::types::{
    address_to_u256, keccak256, u256_be, u256_from_be, u256_to_address, EVMAddress, EVMU256,
};

pub const DEFAULT_GAS: u64 = 10_000_000;

#[derive(Debug, Clone)]
pub struct BlockContext {
    pub coinbase: EVMAddress,
    pub number: EVMU256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub base_fee: EVMU256,
    pub chain_id: u64,
    pub prev_randao: EVMU256,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            coinbase: EVMAddress::zero(),
            number: EVMU256::one(),
            timestamp: 1,
            gas_limit: 30_000_000,
            base_fee: EVMU256::zero(),
            chain_id: 1,
            prev_randao: EVMU256::zero(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub caller: EVMAddress,
    /// `None` for a deploy
    pub to: Option<EVMAddress>,
    pub value: EVMU256,
    pub data: Vec<u8>,
    pub gas: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Stop,
    Return,
    Revert,
    OutOfGas,
    Invalid,
    StackError,
    BadJump,
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub status: VmStatus,
    pub output: Bytes,
    pub gas_used: u64,
    pub pool: RegPool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        matches!(self.status, VmStatus::Stop | VmStatus::Return)
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("call without recipient")]
    MissingRecipient,
}

pub struct Evm<'a> {
    pub state: &'a mut StateDB,
    pub block: BlockContext,
    origin: EVMAddress,
}

impl<'a> Evm<'a> {
    pub fn new(state: &'a mut StateDB, block: BlockContext) -> Self {
        Self {
            state,
            block,
            origin: EVMAddress::zero(),
        }
    }

    /// Run a message call against the recipient's code. The state change is
    /// reverted when the call does not complete.
    pub fn call(&mut self, msg: &Message) -> Result<ExecutionResult, VmError> {
        let to = msg.to.ok_or(VmError::MissingRecipient)?;
        if !self.state.can_transfer(msg.caller, msg.value) {
            return Err(VmError::InsufficientBalance);
        }
        self.origin = msg.caller;
        let snap = self.state.snapshot();
        self.state.transfer(msg.caller, to, msg.value);
        let code = self.state.code(to).to_vec();
        let res = self.execute(to, msg.caller, msg.value, &code, &msg.data, msg.gas, 1);
        if res.success() {
            self.state.commit_to(snap);
        } else {
            self.state.revert_to(snap);
        }
        Ok(res)
    }

    /// Deploy: run the creation code, and on success install the returned
    /// runtime code at the derived address.
    pub fn create(&mut self, msg: &Message) -> Result<(ExecutionResult, EVMAddress), VmError> {
        if !self.state.can_transfer(msg.caller, msg.value) {
            return Err(VmError::InsufficientBalance);
        }
        self.origin = msg.caller;
        let nonce = self.state.nonce(msg.caller);
        let address = create_address(msg.caller, nonce);
        self.state.set_nonce(msg.caller, nonce + 1);

        let snap = self.state.snapshot();
        self.state.create_account(address);
        self.state.transfer(msg.caller, address, msg.value);
        let res = self.execute(address, msg.caller, msg.value, &msg.data, &[], msg.gas, 1);
        if res.success() {
            self.state.set_code(address, res.output.to_vec());
            self.state.commit_to(snap);
        } else {
            self.state.revert_to(snap);
        }
        Ok((res, address))
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &mut self,
        address: EVMAddress,
        caller: EVMAddress,
        value: EVMU256,
        code: &[u8],
        calldata: &[u8],
        gas: u64,
        depth: u64,
    ) -> ExecutionResult {
        let mut pool = RegPool::new();
        let mut stack = Stack::new();
        let mut memory = Memory::new();
        let returndata: Vec<u8> = Vec::new();
        let mut pc: usize = 0;
        let mut gas_left = gas;
        let mut output = Vec::new();

        let jumpdests: HashSet<u64> = InstructionIterator::new(code)
            .filter(|(_, op, _)| *op == OpCode::JUMPDEST)
            .map(|(pc, _, _)| pc)
            .collect();

        let status = loop {
            if pc >= code.len() {
                break VmStatus::Stop;
            }
            let op = OpCode(code[pc]);
            let (pops, pushes) = op.stack_io();
            if stack.len() < pops {
                debug!(pc, op = %op, "stack underflow");
                break VmStatus::StackError;
            }
            if stack.len() - pops + pushes > STACK_LIMIT {
                break VmStatus::StackError;
            }
            let cost = gas_cost(op);
            if gas_left < cost {
                break VmStatus::OutOfGas;
            }
            gas_left -= cost;

            let id = pool.append(depth, pc as u64, op);
            let mut next_pc = pc + 1 + op.push_bytes();

            macro_rules! binop {
                ($f:expr) => {{
                    let a = stack.pop().unwrap_or_default();
                    let b = stack.pop().unwrap_or_default();
                    let _ = stack.push($f(a, b));
                }};
            }
            macro_rules! unop {
                ($f:expr) => {{
                    let a = stack.pop().unwrap_or_default();
                    let _ = stack.push($f(a));
                }};
            }
            macro_rules! triop {
                ($f:expr) => {{
                    let a = stack.pop().unwrap_or_default();
                    let b = stack.pop().unwrap_or_default();
                    let c = stack.pop().unwrap_or_default();
                    let _ = stack.push($f(a, b, c));
                }};
            }

            match op {
                OpCode::STOP => break VmStatus::Stop,
                OpCode::ADD => binop!(arith::add),
                OpCode::MUL => binop!(arith::mul),
                OpCode::SUB => binop!(arith::sub),
                OpCode::DIV => binop!(arith::div),
                OpCode::SDIV => binop!(arith::sdiv),
                OpCode::MOD => binop!(arith::umod),
                OpCode::SMOD => binop!(arith::smod),
                OpCode::ADDMOD => triop!(arith::addmod),
                OpCode::MULMOD => triop!(arith::mulmod),
                OpCode::EXP => binop!(arith::exp),
                OpCode::SIGNEXTEND => binop!(arith::signextend),
                OpCode::LT => binop!(arith::lt),
                OpCode::GT => binop!(arith::gt),
                OpCode::SLT => binop!(arith::slt),
                OpCode::SGT => binop!(arith::sgt),
                OpCode::EQ => binop!(arith::eq),
                OpCode::ISZERO => unop!(arith::iszero),
                OpCode::AND => binop!(|a: EVMU256, b: EVMU256| a & b),
                OpCode::OR => binop!(|a: EVMU256, b: EVMU256| a | b),
                OpCode::XOR => binop!(|a: EVMU256, b: EVMU256| a ^ b),
                OpCode::NOT => unop!(|a: EVMU256| !a),
                OpCode::BYTE => binop!(arith::byte),
                OpCode::SHL => binop!(arith::shl),
                OpCode::SHR => binop!(arith::shr),
                OpCode::SAR => binop!(arith::sar),
                OpCode::KECCAK256 => {
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    pool.set_mem_offset(id, off as u64);
                    let hash = keccak256(memory.slice(off, len));
                    let _ = stack.push(u256_from_be(&hash));
                }
                OpCode::ADDRESS => {
                    let _ = stack.push(address_to_u256(address));
                }
                OpCode::BALANCE => {
                    let a = stack.pop().unwrap_or_default();
                    let _ = stack.push(self.state.balance(u256_to_address(a)));
                }
                OpCode::ORIGIN => {
                    let _ = stack.push(address_to_u256(self.origin));
                }
                OpCode::CALLER => {
                    let _ = stack.push(address_to_u256(caller));
                }
                OpCode::CALLVALUE => {
                    let _ = stack.push(value);
                }
                OpCode::CALLDATALOAD => {
                    let off = stack.pop().unwrap_or_default();
                    pool.set_mem_offset(id, off.low_u64());
                    let _ = stack.push(data_word(calldata, off.low_u64() as usize));
                }
                OpCode::CALLDATASIZE => {
                    let _ = stack.push(EVMU256::from(calldata.len()));
                }
                OpCode::CALLDATACOPY => {
                    let dst = stack.pop().unwrap_or_default().low_u64() as usize;
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    memory.set(dst, &data_slice(calldata, off, len));
                }
                OpCode::CODESIZE => {
                    let _ = stack.push(EVMU256::from(code.len()));
                }
                OpCode::CODECOPY => {
                    let dst = stack.pop().unwrap_or_default().low_u64() as usize;
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    memory.set(dst, &data_slice(code, off, len));
                }
                OpCode::GASPRICE => {
                    let _ = stack.push(EVMU256::zero());
                }
                OpCode::EXTCODESIZE => {
                    let a = stack.pop().unwrap_or_default();
                    let _ = stack.push(EVMU256::from(self.state.code(u256_to_address(a)).len()));
                }
                OpCode::EXTCODECOPY => {
                    let a = stack.pop().unwrap_or_default();
                    let dst = stack.pop().unwrap_or_default().low_u64() as usize;
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    let ext = self.state.code(u256_to_address(a)).to_vec();
                    memory.set(dst, &data_slice(&ext, off, len));
                }
                OpCode::RETURNDATASIZE => {
                    let _ = stack.push(EVMU256::from(returndata.len()));
                }
                OpCode::RETURNDATACOPY => {
                    let dst = stack.pop().unwrap_or_default().low_u64() as usize;
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    memory.set(dst, &data_slice(&returndata, off, len));
                }
                OpCode::EXTCODEHASH => {
                    let a = stack.pop().unwrap_or_default();
                    let h = keccak256(self.state.code(u256_to_address(a)));
                    let _ = stack.push(u256_from_be(&h));
                }
                OpCode::BLOCKHASH => {
                    let _ = stack.pop();
                    let _ = stack.push(EVMU256::zero());
                }
                OpCode::COINBASE => {
                    let _ = stack.push(address_to_u256(self.block.coinbase));
                }
                OpCode::TIMESTAMP => {
                    let _ = stack.push(EVMU256::from(self.block.timestamp));
                }
                OpCode::NUMBER => {
                    let _ = stack.push(self.block.number);
                }
                OpCode::PREVRANDAO => {
                    let _ = stack.push(self.block.prev_randao);
                }
                OpCode::GASLIMIT => {
                    let _ = stack.push(EVMU256::from(self.block.gas_limit));
                }
                OpCode::CHAINID => {
                    let _ = stack.push(EVMU256::from(self.block.chain_id));
                }
                OpCode::SELFBALANCE => {
                    let _ = stack.push(self.state.balance(address));
                }
                OpCode::BASEFEE => {
                    let _ = stack.push(self.block.base_fee);
                }
                OpCode::POP => {
                    let _ = stack.pop();
                }
                OpCode::MLOAD => {
                    let off = stack.pop().unwrap_or_default();
                    pool.set_mem_offset(id, off.low_u64());
                    let _ = stack.push(memory.word(off.low_u64() as usize));
                }
                OpCode::MSTORE => {
                    let off = stack.pop().unwrap_or_default();
                    let val = stack.pop().unwrap_or_default();
                    pool.set_mem_offset(id, off.low_u64());
                    memory.set_word(off.low_u64() as usize, val);
                }
                OpCode::MSTORE8 => {
                    let off = stack.pop().unwrap_or_default();
                    let val = stack.pop().unwrap_or_default();
                    pool.set_mem_offset(id, off.low_u64());
                    memory.set_byte(off.low_u64() as usize, u256_be(val)[31]);
                }
                OpCode::SLOAD => {
                    let key = stack.pop().unwrap_or_default();
                    let val = self.state.storage(address, key);
                    pool.set_slot(id, key, val);
                    let _ = stack.push(val);
                }
                OpCode::SSTORE => {
                    let key = stack.pop().unwrap_or_default();
                    let val = stack.pop().unwrap_or_default();
                    pool.set_slot(id, key, val);
                    self.state.set_storage(address, key, val);
                }
                OpCode::JUMP => {
                    let dest = stack.pop().unwrap_or_default();
                    pool.set_jump(id, dest.low_u64());
                    if !jumpdests.contains(&dest.low_u64()) {
                        break VmStatus::BadJump;
                    }
                    next_pc = dest.low_u64() as usize;
                }
                OpCode::JUMPI => {
                    let dest = stack.pop().unwrap_or_default();
                    let cond = stack.pop().unwrap_or_default();
                    pool.set_branch(id, dest.low_u64(), cond);
                    if !cond.is_zero() {
                        if !jumpdests.contains(&dest.low_u64()) {
                            break VmStatus::BadJump;
                        }
                        next_pc = dest.low_u64() as usize;
                    }
                }
                OpCode::PC => {
                    let _ = stack.push(EVMU256::from(pc));
                }
                OpCode::MSIZE => {
                    let _ = stack.push(EVMU256::from(memory.len()));
                }
                OpCode::GAS => {
                    let _ = stack.push(EVMU256::from(gas_left));
                }
                OpCode::JUMPDEST => {}
                OpCode::RETURN => {
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    output = memory.slice(off, len).to_vec();
                    break VmStatus::Return;
                }
                OpCode::REVERT => {
                    let off = stack.pop().unwrap_or_default().low_u64() as usize;
                    let len = stack.pop().unwrap_or_default().low_u64() as usize;
                    output = memory.slice(off, len).to_vec();
                    break VmStatus::Revert;
                }
                OpCode::INVALID => break VmStatus::Invalid,
                OpCode::SELFDESTRUCT => {
                    let heir = stack.pop().unwrap_or_default();
                    let balance = self.state.balance(address);
                    self.state.transfer(address, u256_to_address(heir), balance);
                    break VmStatus::Stop;
                }
                OpCode::CREATE | OpCode::CREATE2 => {
                    for _ in 0..pops {
                        let _ = stack.pop();
                    }
                    // inner deploys are not executed; report failure
                    let _ = stack.push(EVMU256::zero());
                }
                op if op.is_push() => {
                    let n = op.push_bytes();
                    let start = (pc + 1).min(code.len());
                    let end = (pc + 1 + n).min(code.len());
                    let _ = stack.push(u256_from_be(&code[start..end]));
                }
                op if op.is_dup() => {
                    if stack.dup(op.dup_n()).is_err() {
                        break VmStatus::StackError;
                    }
                }
                op if op.is_swap() => {
                    if stack.swap(op.swap_n()).is_err() {
                        break VmStatus::StackError;
                    }
                }
                op if op.is_log() => {
                    for _ in 0..op.log_n() + 2 {
                        let _ = stack.pop();
                    }
                }
                op if op.is_call() => {
                    // gas, to, (value), in/out regions. settle value, skip
                    // foreign code, report success
                    let _gas = stack.pop().unwrap_or_default();
                    let to = stack.pop().unwrap_or_default();
                    let transferred = if matches!(op, OpCode::CALL | OpCode::CALLCODE) {
                        stack.pop().unwrap_or_default()
                    } else {
                        EVMU256::zero()
                    };
                    for _ in 0..4 {
                        let _ = stack.pop();
                    }
                    let ok = if transferred.is_zero() {
                        true
                    } else if self.state.can_transfer(address, transferred) {
                        self.state
                            .transfer(address, u256_to_address(to), transferred);
                        true
                    } else {
                        false
                    };
                    debug!(op = %op, "external call skipped");
                    let _ = stack.push(EVMU256::from(ok as u64));
                }
                other => {
                    debug!(op = %other, pc, "undefined opcode");
                    break VmStatus::Invalid;
                }
            }

            if pushes > 0 {
                if let Ok(top) = stack.peek(0) {
                    pool.set_value(id, top);
                }
            }
            pc = next_pc;
        };

        ExecutionResult {
            status,
            output: Bytes::from(output),
            gas_used: gas - gas_left,
            pool,
        }
    }
}

fn data_word(data: &[u8], offset: usize) -> EVMU256 {
    let mut word = [0u8; 32];
    if offset < data.len() {
        let end = (offset + 32).min(data.len());
        word[..end - offset].copy_from_slice(&data[offset..end]);
    }
    EVMU256::from_big_endian(&word)
}

fn data_slice(data: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    if offset < data.len() {
        let end = (offset + len).min(data.len());
        out[..end - offset].copy_from_slice(&data[offset..end]);
    }
    out
}

/// Deterministic deployment address: keccak(caller ++ nonce), low 20 bytes.
pub fn create_address(caller: EVMAddress, nonce: u64) -> EVMAddress {
    let mut data = caller.as_bytes().to_vec();
    data.extend_from_slice(&nonce.to_be_bytes());
    let hash = keccak256(&data);
    EVMAddress::from_slice(&hash[12..])
}

fn gas_cost(op: OpCode) -> u64 {
    match op {
        OpCode::SSTORE => 5000,
        OpCode::SLOAD => 200,
        OpCode::KECCAK256 => 36,
        OpCode::EXP => 60,
        OpCode::BALANCE | OpCode::EXTCODESIZE | OpCode::EXTCODEHASH | OpCode::EXTCODECOPY => 100,
        OpCode::CREATE | OpCode::CREATE2 => 32000,
        op if op.is_call() => 700,
        op if op.is_log() => 375,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::register::RegId;
    use crate::types::fixed_address;
    use hex_literal::hex;
    use primitive_types::U256;

    fn sender() -> EVMAddress {
        fixed_address("1111111111111111111111111111111111111111")
    }

    fn target() -> EVMAddress {
        fixed_address("2222222222222222222222222222222222222222")
    }

    fn run_in(db: &mut StateDB, code: &[u8], calldata: &[u8], value: u64) -> ExecutionResult {
        db.add_balance(sender(), U256::from(1u64) << 64);
        db.set_code(target(), code.to_vec());
        let mut evm = Evm::new(db, BlockContext::default());
        evm.call(&Message {
            caller: sender(),
            to: Some(target()),
            value: U256::from(value),
            data: calldata.to_vec(),
            gas: DEFAULT_GAS,
        })
        .unwrap()
    }

    fn run(code: &[u8], calldata: &[u8], value: u64) -> ExecutionResult {
        let mut db = StateDB::new();
        run_in(&mut db, code, calldata, value)
    }

    #[test]
    fn add_program_runs_to_stop() {
        // PUSH1 1, PUSH1 2, ADD, STOP
        let res = run(&hex!("600160020100"), &[], 0);
        assert_eq!(res.status, VmStatus::Stop);
        assert_eq!(res.pool.len(), 4);
        // the ADD register carries the produced word
        assert_eq!(res.pool.get(RegId(2)).value, U256::from(3u64));
    }

    #[test]
    fn sstore_updates_state_and_slot_aux() {
        // PUSH1 1, PUSH1 0, SSTORE, STOP
        let mut db = StateDB::new();
        let res = run_in(&mut db, &hex!("600160005500"), &[], 0);
        assert_eq!(res.status, VmStatus::Stop);
        assert_eq!(db.storage(target(), U256::zero()), U256::one());
        let sstore = res.pool.get(RegId(2));
        assert_eq!(sstore.op, OpCode::SSTORE);
        assert_eq!(sstore.slot_key, U256::zero());
        assert_eq!(sstore.slot_value, U256::one());
    }

    #[test]
    fn jumpi_taken_records_branch_aux() {
        // PUSH1 1, PUSH1 6, JUMPI, STOP, JUMPDEST, STOP
        let res = run(&hex!("6001600657005b00"), &[], 0);
        assert_eq!(res.status, VmStatus::Stop);
        let ji = res.pool.get(RegId(2));
        assert_eq!(ji.op, OpCode::JUMPI);
        assert_eq!(ji.dest, 6);
        assert_eq!(ji.cond, U256::one());
        // the JUMPDEST at 6 was executed
        assert!(res.pool.keys().iter().any(|k| k.index.1 == 6));
    }

    #[test]
    fn calldataload_keeps_its_offset() {
        // PUSH1 4, CALLDATALOAD, STOP
        let mut calldata = vec![0xaa, 0xbb, 0xcc, 0xdd];
        calldata.extend(u256_be(U256::from(99u64)));
        let res = run(&hex!("6004350000"), &calldata, 0);
        let cdl = res.pool.get(RegId(1));
        assert_eq!(cdl.op, OpCode::CALLDATALOAD);
        assert_eq!(cdl.mem_offset, 4);
        assert_eq!(cdl.value, U256::from(99u64));
    }

    #[test]
    fn revert_rolls_back_state() {
        // PUSH1 1, PUSH1 0, SSTORE, PUSH1 0, PUSH1 0, REVERT
        let mut db = StateDB::new();
        let res = run_in(&mut db, &hex!("600160005560006000fd"), &[], 0);
        assert_eq!(res.status, VmStatus::Revert);
        assert!(!res.success());
        assert_eq!(db.storage(target(), U256::zero()), U256::zero());
    }

    #[test]
    fn callvalue_transfers_balance() {
        let mut db = StateDB::new();
        let res = run_in(&mut db, &hex!("00"), &[], 7);
        assert_eq!(res.status, VmStatus::Stop);
        assert_eq!(db.balance(target()), U256::from(7u64));
    }

    #[test]
    fn bad_jump_fails_the_call() {
        // PUSH1 5, JUMP: 5 is not a JUMPDEST
        let res = run(&hex!("600556"), &[], 0);
        assert_eq!(res.status, VmStatus::BadJump);
        assert!(!res.success());
    }
}
