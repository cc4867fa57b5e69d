//! Tolerant bug oracles. Pattern matchers inspect solver models and
//! execution traces, record findings, and never interrupt the run.
use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::evm::opcode::OpCode;
use crate::evm::register::RegPool;

pub const ERR_DIVIDE_BY_ZERO: &str = "divide by zero";
pub const ERR_REENTRANCY: &str = "state write after external call";

/// A zero-valued divisor sentinel anywhere in the model text: either the
/// function-interpretation block shape or a point assignment.
static DIV_ZERO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?:div0|mod0)\S* -> (?:\{\s*$|#x0+\s*$|0\s*$)").expect("div0 pattern")
});

#[derive(Debug, Default)]
pub struct OracleHost {
    nonce: u64,
    report: BTreeMap<String, Vec<String>>,
    seen: HashSet<(String, String)>,
}

impl OracleHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(&self) -> usize {
        self.report.len()
    }

    /// A solver model may witness a divide-by-zero: a `div0`/`mod0` sentinel
    /// assigned zero.
    pub fn divide_zero_check(&mut self, model: &str) {
        if DIV_ZERO.is_match(model) {
            self.assert_finding(ERR_DIVIDE_BY_ZERO, model);
        }
    }

    /// An SSTORE after a call-family opcode within one trace leaves the
    /// contract open to reentrant observation of stale state.
    pub fn reentrancy_check(&mut self, pool: &RegPool, entry: &str) {
        let keys = pool.keys();
        let mut called_at: Option<u64> = None;
        for key in &keys {
            if key.op.is_call() {
                called_at = Some(key.index.1);
            }
            if key.op == OpCode::SSTORE {
                if let Some(call_pc) = called_at {
                    self.assert_finding(
                        ERR_REENTRANCY,
                        &format!(
                            "{entry}: CALL at pc {call_pc} precedes SSTORE at pc {}",
                            key.index.1
                        ),
                    );
                    return;
                }
            }
        }
    }

    /// Record one finding per distinct (kind, context); the key carries a
    /// per-finding nonce.
    fn assert_finding(&mut self, kind: &str, ctx: &str) {
        if !self.seen.insert((kind.to_string(), ctx.to_string())) {
            return;
        }
        let key = format!("{kind}-{}", self.nonce);
        self.nonce += 1;
        self.report.entry(key).or_default().push(ctx.to_string());
    }

    pub fn human_report(&self) -> String {
        let mut out = String::new();
        for (key, ctxs) in &self.report {
            out.push_str(&format!(
                "===================================\n{key}\n-----------------------------------\n"
            ));
            for ctx in ctxs {
                out.push_str(ctx);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_divisor_sentinel_is_a_finding_with_nonce_zero() {
        let mut oracle = OracleHost::new();
        let model = "withdraw:uint256_amount -> 0\ndiv0 -> {\n  0\n}\n";
        oracle.divide_zero_check(model);
        assert_eq!(oracle.findings(), 1);
        assert!(oracle.human_report().contains("divide by zero-0"));
    }

    #[test]
    fn point_assignment_shape_also_matches() {
        let mut oracle = OracleHost::new();
        oracle.divide_zero_check("div0_0 -> #x0000000000000000000000000000000000000000000000000000000000000000\n");
        assert_eq!(oracle.findings(), 1);
    }

    #[test]
    fn nonzero_divisor_is_not_a_finding() {
        let mut oracle = OracleHost::new();
        oracle.divide_zero_check("div0_0 -> #x0000000000000000000000000000000000000000000000000000000000000002\n");
        oracle.divide_zero_check("CallValue -> 0\n");
        assert_eq!(oracle.findings(), 0);
    }

    #[test]
    fn duplicate_context_is_recorded_once() {
        let mut oracle = OracleHost::new();
        let model = "div0 -> {\n  0\n}\n";
        oracle.divide_zero_check(model);
        oracle.divide_zero_check(model);
        assert_eq!(oracle.findings(), 1);
    }

    #[test]
    fn write_after_call_is_flagged() {
        let mut pool = RegPool::new();
        pool.append(1, 10, OpCode::CALL);
        pool.append(1, 20, OpCode::SSTORE);
        let mut oracle = OracleHost::new();
        oracle.reentrancy_check(&pool, "withdraw");
        assert_eq!(oracle.findings(), 1);

        // write before the call is fine
        let mut pool = RegPool::new();
        pool.append(1, 5, OpCode::SSTORE);
        pool.append(1, 10, OpCode::CALL);
        let mut oracle = OracleHost::new();
        oracle.reentrancy_check(&pool, "withdraw");
        assert_eq!(oracle.findings(), 0);
    }
}
