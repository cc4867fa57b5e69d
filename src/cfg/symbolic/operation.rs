//! One lut entry per instruction: the opcode's declared stack behaviour plus
//! its push immediate, and the pure evaluator dispatch.
use crate::evm::arith;
use crate::evm::opcode::OpCode;
use crate::types::EVMU256;

#[derive(Debug, Clone)]
pub struct Operation {
    pub op: OpCode,
    pub pc: u64,
    pub param_size: usize,
    pub pushback_size: usize,
    /// push immediate; meaningless for other opcodes
    pub val: EVMU256,
}

impl Operation {
    pub fn new(op: OpCode, pc: u64, val: EVMU256) -> Self {
        let (param_size, pushback_size) = op.stack_io();
        Self {
            op,
            pc,
            param_size,
            pushback_size,
            val,
        }
    }
}

/// Evaluate one opcode over already-resolved operands, bottom of the
/// consumed range first (`params[len-1]` is the top of the stack). `None`
/// operands and program-external reads produce `None`, which the caller
/// propagates.
pub fn eval(op: &Operation, params: &[Option<EVMU256>]) -> Option<EVMU256> {
    if op.op.is_push() {
        return Some(op.val);
    }
    let mut vals = Vec::with_capacity(params.len());
    for p in params {
        vals.push((*p)?);
    }
    // operand order mirrors the interpreter: `a` was the top of the stack
    let top = |i: usize| vals[vals.len() - 1 - i];
    Some(match op.op {
        OpCode::ADD => arith::add(top(0), top(1)),
        OpCode::MUL => arith::mul(top(0), top(1)),
        OpCode::SUB => arith::sub(top(0), top(1)),
        OpCode::DIV => arith::div(top(0), top(1)),
        OpCode::SDIV => arith::sdiv(top(0), top(1)),
        OpCode::MOD => arith::umod(top(0), top(1)),
        OpCode::SMOD => arith::smod(top(0), top(1)),
        OpCode::ADDMOD => arith::addmod(top(0), top(1), top(2)),
        OpCode::MULMOD => arith::mulmod(top(0), top(1), top(2)),
        OpCode::EXP => arith::exp(top(0), top(1)),
        OpCode::SIGNEXTEND => arith::signextend(top(0), top(1)),
        OpCode::LT => arith::lt(top(0), top(1)),
        OpCode::GT => arith::gt(top(0), top(1)),
        OpCode::SLT => arith::slt(top(0), top(1)),
        OpCode::SGT => arith::sgt(top(0), top(1)),
        OpCode::EQ => arith::eq(top(0), top(1)),
        OpCode::ISZERO => arith::iszero(top(0)),
        OpCode::AND => top(0) & top(1),
        OpCode::OR => top(0) | top(1),
        OpCode::XOR => top(0) ^ top(1),
        OpCode::NOT => !top(0),
        OpCode::BYTE => arith::byte(top(0), top(1)),
        OpCode::SHL => arith::shl(top(0), top(1)),
        OpCode::SHR => arith::shr(top(0), top(1)),
        OpCode::SAR => arith::sar(top(0), top(1)),
        // everything else reads program-external state
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    fn op(o: OpCode) -> Operation {
        Operation::new(o, 0, U256::zero())
    }

    #[test]
    fn evaluates_pure_arithmetic() {
        // stack [.., 5, 2], SUB pops 2 then 5? no: top is 2 after pushing 5 then 2
        let params = vec![Some(U256::from(5u64)), Some(U256::from(2u64))];
        assert_eq!(eval(&op(OpCode::SUB), &params), Some(U256::from(2u64).overflowing_sub(U256::from(5u64)).0));
    }

    #[test]
    fn unknown_operand_poisons_the_result() {
        let params = vec![None, Some(U256::one())];
        assert_eq!(eval(&op(OpCode::ADD), &params), None);
    }

    #[test]
    fn environment_reads_are_unknown() {
        assert_eq!(eval(&op(OpCode::CALLVALUE), &[]), None);
        assert_eq!(eval(&op(OpCode::SLOAD), &[Some(U256::zero())]), None);
    }

    #[test]
    fn push_yields_its_immediate() {
        let o = Operation::new(OpCode::PUSH2, 0, U256::from(0x1234u64));
        assert_eq!(eval(&o, &[]), Some(U256::from(0x1234u64)));
    }
}
