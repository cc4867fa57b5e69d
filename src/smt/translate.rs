//! Lower a conditional-jump condition from the register DAG into solver
//! constraints whose model drives execution down the *other* side.
use std::collections::HashMap;

use thiserror::Error;

use crate::evm::opcode::OpCode;
use crate::evm::register::{RegId, RegPool};
use crate::mutator::Exclusions;
use crate::smt::expr::{Expr, SymOp, VarKind};
use crate::types::EVMU256;

#[derive(Debug, Error)]
pub enum SmtError {
    #[error("unsupported opcode in condition walk: {0}")]
    Unsupported(OpCode),
    #[error("malformed register shape")]
    Shape,
}

/// A self-contained constraint set: assert everything, check, read the model.
#[derive(Debug)]
pub struct Query {
    pub asserts: Vec<Box<Expr>>,
    pub vars: HashMap<String, VarKind>,
}

struct Translator<'p> {
    pool: &'p RegPool,
    /// extra assertions produced along the walk (divisor sentinels)
    extra: Vec<Box<Expr>>,
    div_seq: usize,
    mod_seq: usize,
}

impl<'p> Translator<'p> {
    fn new(pool: &'p RegPool) -> Self {
        Self {
            pool,
            extra: Vec::new(),
            div_seq: 0,
            mod_seq: 0,
        }
    }

    fn parent(&self, id: RegId, slot: usize) -> Result<RegId, SmtError> {
        self.pool.get(id).parent(slot).ok_or(SmtError::Shape)
    }

    /// expression of the top-of-stack operand of a binary register
    fn top_expr(&mut self, id: RegId) -> Result<Box<Expr>, SmtError> {
        let p = self.parent(id, self.pool.get(id).param_size - 1)?;
        self.expr_of(p)
    }

    /// expression of the deeper operand of a binary register
    fn bottom_expr(&mut self, id: RegId) -> Result<Box<Expr>, SmtError> {
        let p = self.parent(id, 0)?;
        self.expr_of(p)
    }

    /// Equate a fresh sentinel variable with a symbolic divisor so the model
    /// text exposes its chosen value (`div0_<n>`/`mod0_<n>`); the oracle
    /// pattern-matches zero-valued sentinels.
    fn divisor_sentinel(&mut self, rhs: &Expr, modulo: bool) {
        if rhs.is_concrete() {
            return;
        }
        let name = if modulo {
            let n = self.mod_seq;
            self.mod_seq += 1;
            format!("mod0_{n}")
        } else {
            let n = self.div_seq;
            self.div_seq += 1;
            format!("div0_{n}")
        };
        let var = Expr::var(name, VarKind::Unsigned(256));
        self.extra.push(var.equal(Box::new(rhs.clone())));
    }

    fn expr_of(&mut self, id: RegId) -> Result<Box<Expr>, SmtError> {
        let reg = self.pool.get(id);

        if reg.op.is_dup() || reg.op.is_swap() {
            return self.expr_of(reg.cp().ok_or(SmtError::Shape)?);
        }
        if reg.op.is_push() {
            return Ok(Expr::word(reg.value));
        }
        if let Some(bind) = &reg.arg_bind {
            let kind = if bind.signed {
                VarKind::Signed(bind.bits)
            } else {
                VarKind::Unsigned(bind.bits)
            };
            return Ok(Expr::var(bind.vault.clone(), kind));
        }

        match reg.op {
            OpCode::CALLVALUE => Ok(Expr::var(crate::mutator::MAGIC_CALL_VALUE, VarKind::CallValue)),
            OpCode::CALLER => Ok(Expr::var("Caller", VarKind::Unsigned(160))),
            OpCode::ORIGIN => Ok(Expr::var("Origin", VarKind::Unsigned(160))),
            OpCode::TIMESTAMP => Ok(Expr::var("Timestamp", VarKind::Unsigned(256))),
            OpCode::NUMBER => Ok(Expr::var("BlockNumber", VarKind::Unsigned(256))),

            OpCode::ADD => Ok(self.top_expr(id)?.add(self.bottom_expr(id)?)),
            OpCode::SUB => Ok(self.top_expr(id)?.sub(self.bottom_expr(id)?)),
            OpCode::MUL => Ok(self.top_expr(id)?.mul(self.bottom_expr(id)?)),
            OpCode::DIV => {
                let rhs = self.bottom_expr(id)?;
                self.divisor_sentinel(&rhs, false);
                Ok(self.top_expr(id)?.div(rhs))
            }
            OpCode::SDIV => {
                let rhs = self.bottom_expr(id)?;
                self.divisor_sentinel(&rhs, false);
                Ok(self.top_expr(id)?.bvsdiv(rhs))
            }
            OpCode::MOD => {
                let rhs = self.bottom_expr(id)?;
                self.divisor_sentinel(&rhs, true);
                Ok(self.top_expr(id)?.bvurem(rhs))
            }
            OpCode::SMOD => {
                let rhs = self.bottom_expr(id)?;
                self.divisor_sentinel(&rhs, true);
                Ok(self.top_expr(id)?.bvsrem(rhs))
            }
            OpCode::AND => Ok(self.top_expr(id)?.bvand(self.bottom_expr(id)?)),
            OpCode::OR => Ok(self.top_expr(id)?.bvor(self.bottom_expr(id)?)),
            OpCode::XOR => Ok(self.top_expr(id)?.bvxor(self.bottom_expr(id)?)),
            OpCode::NOT => Ok(self.bottom_expr(id)?.bvnot()),
            // shifts: the deeper operand is the shifted value
            OpCode::SHL => Ok(self.bottom_expr(id)?.bvshl(self.top_expr(id)?)),
            OpCode::SHR => Ok(self.bottom_expr(id)?.bvlshr(self.top_expr(id)?)),
            OpCode::SAR => Ok(self.bottom_expr(id)?.bvsar(self.top_expr(id)?)),

            OpCode::EQ => Ok(self.top_expr(id)?.equal(self.bottom_expr(id)?)),
            OpCode::LT => Ok(self.top_expr(id)?.bvult(self.bottom_expr(id)?)),
            OpCode::GT => Ok(self.top_expr(id)?.bvugt(self.bottom_expr(id)?)),
            OpCode::SLT => Ok(self.top_expr(id)?.bvslt(self.bottom_expr(id)?)),
            OpCode::SGT => Ok(self.top_expr(id)?.bvsgt(self.bottom_expr(id)?)),
            OpCode::ISZERO => Ok(self
                .bottom_expr(id)?
                .equal(Expr::word(EVMU256::zero()))),

            other => Err(SmtError::Unsupported(other)),
        }
    }
}

fn bounds_for(name: &str, kind: VarKind) -> Vec<Box<Expr>> {
    let var = || Expr::var(name.to_string(), kind);
    match kind {
        VarKind::Unsigned(bits) if bits < 256 => {
            vec![var().bvult(Expr::word(EVMU256::one() << bits))]
        }
        VarKind::Unsigned(_) => vec![],
        VarKind::Signed(bits) if bits < 256 => {
            let max = EVMU256::one() << (bits - 1);
            let min = crate::evm::arith::twos_neg(max);
            vec![
                var().bvslt(Expr::word(max)),
                var().bvslt(Expr::word(min)).lnot(),
            ]
        }
        VarKind::Signed(_) => vec![],
        // pinned non-negative: the sign bit stays clear
        VarKind::CallValue => vec![var().bvult(Expr::word(EVMU256::one() << 255))],
    }
}

/// Build the query whose model flips the observed branch of `cond`.
pub fn flip_branch_query(
    pool: &RegPool,
    cond: RegId,
    observed: EVMU256,
    exclusions: &Exclusions,
) -> Result<Query, SmtError> {
    let mut tr = Translator::new(pool);
    let cond_expr = tr.expr_of(cond)?;
    let observed_truth = !observed.is_zero();

    let assertion = if cond_expr.is_boolean() {
        // observed non-zero: force the relation false; observed zero: force
        // it to hold
        if observed_truth {
            cond_expr.lnot()
        } else {
            cond_expr
        }
    } else {
        // plain value condition (AND/OR/SUB/... shapes): flip its zeroness
        let zero = Expr::word(EVMU256::zero());
        if observed_truth {
            cond_expr.equal(zero)
        } else {
            cond_expr.equal(zero).lnot()
        }
    };

    let mut asserts = vec![assertion];
    asserts.append(&mut tr.extra);

    let mut var_list = Vec::new();
    for a in &asserts {
        a.collect_vars(&mut var_list);
    }
    let mut vars = HashMap::new();
    for (name, kind) in &var_list {
        vars.insert(name.clone(), *kind);
        asserts.extend(bounds_for(name, *kind));
    }

    for (name, value) in exclusions {
        if let Some(kind) = vars.get(name) {
            asserts.push(
                Expr::var(name.clone(), *kind)
                    .equal(Expr::word(*value))
                    .lnot(),
            );
        }
    }

    Ok(Query { asserts, vars })
}
