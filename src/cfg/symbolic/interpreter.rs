//! Symbolic walk over a PC sequence. Produces the concrete destination of
//! the terminating jump when the operand chain is pure, a `Halt` for the
//! halt family, or `Unresolved` when the value depends on external data.
use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::cfg::symbolic::dest_stack::DestStack;
use crate::cfg::symbolic::operation::{eval, Operation};
use crate::cfg::symbolic::stack::SymStack;
use crate::evm::opcode::OpCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// ended on the halt family
    Halt,
    /// terminating jump resolved to this PC
    Dest(u64),
    /// value depends on memory/storage/environment (or the sequence ended
    /// mid-block); the caller may still extend the fall-through successor
    Unresolved,
}

#[derive(Debug, Error)]
pub enum SymbolicError {
    #[error("no operation recorded for pc {0}")]
    UnknownPc(u64),
    #[error("stack underflow at pc {0}")]
    Underflow(u64),
}

pub struct SymbolicInterpreter {
    lut: HashMap<u64, Operation>,
}

impl SymbolicInterpreter {
    pub fn new(lut: HashMap<u64, Operation>) -> Self {
        Self { lut }
    }

    /// Walk `stmts` (instruction PCs of a candidate block sequence) once.
    /// The walk is stateless across calls and never touches memory or
    /// storage.
    pub fn run(&self, stmts: &[u64], dest_stack: &mut DestStack) -> Result<Outcome, SymbolicError> {
        let mut stack = SymStack::new();

        for (i, pc) in stmts.iter().enumerate() {
            let opera = self
                .lut
                .get(pc)
                .ok_or(SymbolicError::UnknownPc(*pc))?;
            let op = opera.op;
            let last = i + 1 == stmts.len();

            if op == OpCode::PUSH2 {
                dest_stack.safe_push(opera.val.low_u64());
            }

            if last {
                if op.is_halt() {
                    return Ok(Outcome::Halt);
                }
                if op == OpCode::JUMP || op == OpCode::JUMPI {
                    let params = stack
                        .pop_n(opera.param_size)
                        .map_err(|_| SymbolicError::Underflow(*pc))?;
                    // the destination operand is the top of the stack
                    let dest = params.last().copied().flatten();
                    return Ok(match dest.or_else(|| dest_stack.peek().map(Into::into)) {
                        Some(d) => Outcome::Dest(d.low_u64()),
                        None => {
                            debug!(pc, "terminating jump did not resolve");
                            Outcome::Unresolved
                        }
                    });
                }
                // sequence ends mid-block; only the fall-through can extend it
                return Ok(Outcome::Unresolved);
            }

            if op == OpCode::POP {
                stack.pop().map_err(|_| SymbolicError::Underflow(*pc))?;
                continue;
            }
            if op.is_dup() {
                stack
                    .dup(op.dup_n())
                    .map_err(|_| SymbolicError::Underflow(*pc))?;
                continue;
            }
            if op.is_swap() {
                stack
                    .swap(op.swap_n())
                    .map_err(|_| SymbolicError::Underflow(*pc))?;
                continue;
            }

            let params = stack
                .pop_n(opera.param_size)
                .map_err(|_| SymbolicError::Underflow(*pc))?;

            if op == OpCode::JUMP || op == OpCode::JUMPI {
                // a jump mid-sequence consumes the destination this block
                // pushed earlier
                let _ = dest_stack.pop();
                continue;
            }

            if opera.pushback_size > 0 {
                let value = eval(opera, &params);
                stack.push_n(value, opera.pushback_size);
            }
        }

        Ok(Outcome::Unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::u256_from_be;
    use primitive_types::U256;
    use std::collections::HashSet;

    fn lut_for(code: &[u8]) -> HashMap<u64, Operation> {
        crate::asm::InstructionIterator::new(code)
            .map(|(pc, op, arg)| (pc, Operation::new(op, pc, u256_from_be(arg))))
            .collect()
    }

    fn dests_for(code: &[u8]) -> HashSet<u64> {
        crate::asm::InstructionIterator::new(code)
            .filter(|(_, op, _)| *op == OpCode::JUMPDEST)
            .map(|(pc, _, _)| pc)
            .collect()
    }

    fn run(code: &[u8], stmts: &[u64]) -> Result<Outcome, SymbolicError> {
        let interp = SymbolicInterpreter::new(lut_for(code));
        let mut ds = DestStack::new(dests_for(code));
        interp.run(stmts, &mut ds)
    }

    #[test]
    fn halting_sequence_reports_halt() {
        // PUSH1 1, PUSH1 2, ADD, STOP
        let code = hex::decode("600160020100").unwrap();
        assert_eq!(run(&code, &[0, 2, 4, 5]).unwrap(), Outcome::Halt);
    }

    #[test]
    fn same_sequence_twice_is_deterministic() {
        let code = hex::decode("600160020100").unwrap();
        let a = run(&code, &[0, 2, 4, 5]).unwrap();
        let b = run(&code, &[0, 2, 4, 5]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resolves_a_pushed_jump_destination() {
        // PUSH1 3, JUMP, JUMPDEST, STOP
        let code = hex::decode("6003565b00").unwrap();
        assert_eq!(run(&code, &[0, 2]).unwrap(), Outcome::Dest(3));
    }

    #[test]
    fn arithmetic_feeds_the_destination() {
        // 0:PUSH1 2, 2:PUSH1 4, 4:ADD, 5:JUMP, 6:JUMPDEST, 7:STOP
        let code = hex::decode("6002600401565b00").unwrap();
        assert_eq!(run(&code, &[0, 2, 4, 5]).unwrap(), Outcome::Dest(6));
    }

    #[test]
    fn jumpi_resolves_the_destination_operand() {
        // PUSH1 0 (cond), PUSH1 6 (dest), JUMPI, STOP, JUMPDEST, STOP
        let code = hex::decode("6000600657005b00").unwrap();
        assert_eq!(run(&code, &[0, 2, 4]).unwrap(), Outcome::Dest(6));
    }

    #[test]
    fn environment_dependence_is_unresolved() {
        // CALLVALUE, JUMP
        let code = hex::decode("3456").unwrap();
        assert_eq!(run(&code, &[0, 1]).unwrap(), Outcome::Unresolved);
    }

    #[test]
    fn underflow_is_an_error() {
        // lone ADD with an empty stack
        let code = hex::decode("0100").unwrap();
        assert!(run(&code, &[0, 1]).is_err());
    }

    #[test]
    fn mid_block_sequence_is_unresolved() {
        // PUSH1 1 then sequence stops before any terminator
        let code = hex::decode("60015b00").unwrap();
        assert_eq!(run(&code, &[0]).unwrap(), Outcome::Unresolved);
    }
}
