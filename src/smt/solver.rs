//! The solver boundary. The translator hands over a [`Query`]; this module
//! owns the only code that speaks to Z3, through a three-operation session:
//! assert, check-sat, model-text.
use std::collections::HashMap;

use z3::ast::{Ast, Bool, BV};
use z3::{Config, Context, SatResult, Solver};

use crate::smt::expr::{Expr, SymOp};
use crate::smt::translate::{Query, SmtError};
use crate::types::EVMU256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    /// raw model text; the mutator parses it line by line
    Sat(String),
    Unsat,
    Unknown,
}

/// Solve a query in a fresh context. Every path through returns; solver
/// breakage degrades to `Unknown`.
pub fn solve(query: &Query) -> SolveOutcome {
    let cfg = Config::new();
    let ctx = Context::new(&cfg);
    let mut session = Session::new(&ctx);

    for assert in &query.asserts {
        if session.assert(assert).is_err() {
            return SolveOutcome::Unknown;
        }
    }

    #[cfg(feature = "z3_debug")]
    {
        for a in &query.asserts {
            tracing::debug!(assert = %a.pretty_print_str(), "z3 assert");
        }
    }

    match session.check_sat() {
        SatResult::Sat => match session.model_text() {
            Some(model) => {
                #[cfg(feature = "z3_debug")]
                tracing::debug!(%model, "z3 model");
                SolveOutcome::Sat(model)
            }
            None => SolveOutcome::Unknown,
        },
        SatResult::Unsat => SolveOutcome::Unsat,
        SatResult::Unknown => SolveOutcome::Unknown,
    }
}

enum Lowered<'ctx> {
    Word(BV<'ctx>),
    Cond(Bool<'ctx>),
}

struct Session<'ctx> {
    ctx: &'ctx Context,
    solver: Solver<'ctx>,
    consts: HashMap<String, BV<'ctx>>,
}

impl<'ctx> Session<'ctx> {
    fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            solver: Solver::new(ctx),
            consts: HashMap::new(),
        }
    }

    fn assert(&mut self, expr: &Expr) -> Result<(), SmtError> {
        let lowered = self.lower(expr)?;
        let cond = self.as_bool(lowered);
        self.solver.assert(&cond);
        Ok(())
    }

    fn check_sat(&self) -> SatResult {
        self.solver.check()
    }

    fn model_text(&self) -> Option<String> {
        self.solver.get_model().map(|m| m.to_string())
    }

    fn var(&mut self, name: &str) -> BV<'ctx> {
        if let Some(bv) = self.consts.get(name) {
            return bv.clone();
        }
        let bv = BV::new_const(self.ctx, name, 256);
        self.consts.insert(name.to_string(), bv.clone());
        bv
    }

    fn as_bv(&self, lowered: Lowered<'ctx>) -> BV<'ctx> {
        match lowered {
            Lowered::Word(bv) => bv,
            Lowered::Cond(b) => b.ite(
                &bv_from_u256(self.ctx, EVMU256::one()),
                &bv_from_u256(self.ctx, EVMU256::zero()),
            ),
        }
    }

    fn as_bool(&self, lowered: Lowered<'ctx>) -> Bool<'ctx> {
        match lowered {
            Lowered::Cond(b) => b,
            Lowered::Word(bv) => bv
                ._eq(&bv_from_u256(self.ctx, EVMU256::zero()))
                .not(),
        }
    }

    fn lower(&mut self, expr: &Expr) -> Result<Lowered<'ctx>, SmtError> {
        match &expr.op {
            SymOp::Word(v) => Ok(Lowered::Word(bv_from_u256(self.ctx, *v))),
            SymOp::Var(name, _) => Ok(Lowered::Word(self.var(name))),
            SymOp::Lnot => {
                let inner = self.lower(expr.lhs.as_deref().ok_or(SmtError::Shape)?)?;
                Ok(Lowered::Cond(self.as_bool(inner).not()))
            }
            SymOp::Not => {
                let inner = self.lower(expr.lhs.as_deref().ok_or(SmtError::Shape)?)?;
                Ok(Lowered::Word(self.as_bv(inner).bvnot()))
            }
            op => {
                let lhs = self.lower(expr.lhs.as_deref().ok_or(SmtError::Shape)?)?;
                let rhs = self.lower(expr.rhs.as_deref().ok_or(SmtError::Shape)?)?;
                let l = self.as_bv(lhs);
                let r = self.as_bv(rhs);
                Ok(match op {
                    SymOp::Add => Lowered::Word(l.bvadd(&r)),
                    SymOp::Sub => Lowered::Word(l.bvsub(&r)),
                    SymOp::Mul => Lowered::Word(l.bvmul(&r)),
                    SymOp::Div => Lowered::Word(l.bvudiv(&r)),
                    SymOp::Sdiv => Lowered::Word(l.bvsdiv(&r)),
                    SymOp::Umod => Lowered::Word(l.bvurem(&r)),
                    // remainder takes the dividend's sign, as the opcode does
                    SymOp::Smod => Lowered::Word(l.bvsrem(&r)),
                    SymOp::And => Lowered::Word(l.bvand(&r)),
                    SymOp::Or => Lowered::Word(l.bvor(&r)),
                    SymOp::Xor => Lowered::Word(l.bvxor(&r)),
                    SymOp::Shl => Lowered::Word(l.bvshl(&r)),
                    SymOp::Shr => Lowered::Word(l.bvlshr(&r)),
                    SymOp::Sar => Lowered::Word(l.bvashr(&r)),
                    SymOp::Eq => Lowered::Cond(l._eq(&r)),
                    SymOp::Lt => Lowered::Cond(l.bvult(&r)),
                    SymOp::Gt => Lowered::Cond(l.bvugt(&r)),
                    SymOp::Slt => Lowered::Cond(l.bvslt(&r)),
                    SymOp::Sgt => Lowered::Cond(l.bvsgt(&r)),
                    _ => return Err(SmtError::Shape),
                })
            }
        }
    }
}

/// 256-bit vector from four 64-bit limbs, most significant first.
fn bv_from_u256<'ctx>(ctx: &'ctx Context, v: EVMU256) -> BV<'ctx> {
    let limbs = v.0;
    BV::from_u64(ctx, limbs[3], 64)
        .concat(&BV::from_u64(ctx, limbs[2], 64))
        .concat(&BV::from_u64(ctx, limbs[1], 64))
        .concat(&BV::from_u64(ctx, limbs[0], 64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::expr::VarKind;
    use primitive_types::U256;
    use std::collections::HashMap as Map;

    fn query(asserts: Vec<Box<Expr>>) -> Query {
        Query {
            asserts,
            vars: Map::new(),
        }
    }

    #[test]
    fn satisfiable_equality_yields_a_model_with_the_variable() {
        // CallValue == 1
        let q = query(vec![Expr::var("CallValue", VarKind::CallValue)
            .equal(Expr::word(U256::one()))]);
        match solve(&q) {
            SolveOutcome::Sat(model) => {
                assert!(model.contains("CallValue"), "model was: {model}");
                assert!(model.contains('1'), "model was: {model}");
            }
            other => panic!("expected sat, got {other:?}"),
        }
    }

    #[test]
    fn contradiction_is_unsat() {
        let x = || Expr::var("x", VarKind::Unsigned(256));
        let q = query(vec![
            x().equal(Expr::word(U256::one())),
            x().equal(Expr::word(U256::from(2u64))),
        ]);
        assert_eq!(solve(&q), SolveOutcome::Unsat);
    }

    #[test]
    fn exclusion_steers_to_another_witness() {
        // x < 2 and x != 0 forces x == 1
        let x = || Expr::var("x", VarKind::Unsigned(256));
        let q = query(vec![
            x().bvult(Expr::word(U256::from(2u64))),
            x().equal(Expr::word(U256::zero())).lnot(),
        ]);
        match solve(&q) {
            SolveOutcome::Sat(model) => assert!(model.contains('1'), "model was: {model}"),
            other => panic!("expected sat, got {other:?}"),
        }
    }

    #[test]
    fn value_conditions_lower_through_zero_tests() {
        // assert bvand(x, 0xff) as a bare value: it must be non-zero
        let q = query(vec![Expr::var("x", VarKind::Unsigned(256))
            .bvand(Expr::word(U256::from(0xffu64)))]);
        assert!(matches!(solve(&q), SolveOutcome::Sat(_)));
    }
}
