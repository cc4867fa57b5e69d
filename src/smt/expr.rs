//! The expression DAG handed to the solver layer. Built from the register
//! trace, kept free of any solver-specific types.
use serde::{Deserialize, Serialize};

use crate::types::EVMU256;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VarKind {
    Unsigned(usize),
    Signed(usize),
    /// call value: non-negative by construction
    CallValue,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SymOp {
    /// concrete 256-bit word
    Word(EVMU256),
    /// fresh symbolic variable with type-appropriate bounds
    Var(String, VarKind),
    Add,
    Sub,
    Mul,
    Div,
    Sdiv,
    Umod,
    Smod,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Sar,
    // comparisons produce booleans at the solver layer
    Eq,
    Lt,
    Gt,
    Slt,
    Sgt,
    /// logical negation of a boolean expression
    Lnot,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Expr {
    pub lhs: Option<Box<Expr>>,
    pub rhs: Option<Box<Expr>>,
    pub op: SymOp,
}

macro_rules! binary {
    ($name:ident, $op:expr) => {
        pub fn $name(self: Box<Expr>, rhs: Box<Expr>) -> Box<Expr> {
            Box::new(Expr {
                lhs: Some(self),
                rhs: Some(rhs),
                op: $op,
            })
        }
    };
}

impl Expr {
    pub fn word(v: EVMU256) -> Box<Expr> {
        Box::new(Expr {
            lhs: None,
            rhs: None,
            op: SymOp::Word(v),
        })
    }

    pub fn var(name: impl Into<String>, kind: VarKind) -> Box<Expr> {
        Box::new(Expr {
            lhs: None,
            rhs: None,
            op: SymOp::Var(name.into(), kind),
        })
    }

    binary!(add, SymOp::Add);
    binary!(sub, SymOp::Sub);
    binary!(mul, SymOp::Mul);
    binary!(div, SymOp::Div);
    binary!(bvsdiv, SymOp::Sdiv);
    binary!(bvurem, SymOp::Umod);
    binary!(bvsrem, SymOp::Smod);
    binary!(bvand, SymOp::And);
    binary!(bvor, SymOp::Or);
    binary!(bvxor, SymOp::Xor);
    binary!(bvshl, SymOp::Shl);
    binary!(bvlshr, SymOp::Shr);
    binary!(bvsar, SymOp::Sar);
    binary!(equal, SymOp::Eq);
    binary!(bvult, SymOp::Lt);
    binary!(bvugt, SymOp::Gt);
    binary!(bvslt, SymOp::Slt);
    binary!(bvsgt, SymOp::Sgt);

    pub fn bvnot(self: Box<Expr>) -> Box<Expr> {
        Box::new(Expr {
            lhs: Some(self),
            rhs: None,
            op: SymOp::Not,
        })
    }

    /// logical not
    pub fn lnot(self: Box<Expr>) -> Box<Expr> {
        Box::new(Expr {
            lhs: Some(self),
            rhs: None,
            op: SymOp::Lnot,
        })
    }

    /// `true` when no symbolic variable occurs anywhere below.
    pub fn is_concrete(&self) -> bool {
        if let SymOp::Var(..) = self.op {
            return false;
        }
        self.lhs.as_deref().map(Expr::is_concrete).unwrap_or(true)
            && self.rhs.as_deref().map(Expr::is_concrete).unwrap_or(true)
    }

    /// `true` when the expression lowers to a boolean.
    pub fn is_boolean(&self) -> bool {
        matches!(
            self.op,
            SymOp::Eq | SymOp::Lt | SymOp::Gt | SymOp::Slt | SymOp::Sgt | SymOp::Lnot
        )
    }

    pub fn depth(&self) -> u32 {
        let l = self.lhs.as_deref().map(Expr::depth).unwrap_or(0);
        let r = self.rhs.as_deref().map(Expr::depth).unwrap_or(0);
        if self.lhs.is_none() && self.rhs.is_none() {
            0
        } else {
            l.max(r) + 1
        }
    }

    pub fn pretty_print_str(&self) -> String {
        match (&self.lhs, &self.rhs) {
            (None, None) => format!("{:?}", self.op),
            _ => {
                let mut s = format!("{:?}(", self.op);
                if let Some(l) = &self.lhs {
                    s.push_str(&l.pretty_print_str());
                    s.push(',');
                }
                if let Some(r) = &self.rhs {
                    s.push_str(&r.pretty_print_str());
                }
                s.push(')');
                s
            }
        }
    }

    /// every variable occurring in the expression, with its kind
    pub fn collect_vars(&self, out: &mut Vec<(String, VarKind)>) {
        if let SymOp::Var(name, kind) = &self.op {
            if !out.iter().any(|(n, _)| n == name) {
                out.push((name.clone(), *kind));
            }
        }
        if let Some(l) = &self.lhs {
            l.collect_vars(out);
        }
        if let Some(r) = &self.rhs {
            r.collect_vars(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    #[test]
    fn concreteness_tracks_variables() {
        let pure = Expr::word(U256::one()).add(Expr::word(U256::from(2u64)));
        assert!(pure.is_concrete());
        let tainted = Expr::var("CallValue", VarKind::CallValue).add(Expr::word(U256::one()));
        assert!(!tainted.is_concrete());
    }

    #[test]
    fn booleans_are_rooted_at_comparisons() {
        let c = Expr::var("x", VarKind::Unsigned(256)).equal(Expr::word(U256::zero()));
        assert!(c.is_boolean());
        assert!(c.clone().lnot().is_boolean());
        let v = Expr::word(U256::one()).add(Expr::word(U256::one()));
        assert!(!v.is_boolean());
    }

    #[test]
    fn depth_and_rendering() {
        let e = Expr::var("x", VarKind::Unsigned(8))
            .add(Expr::word(U256::one()))
            .equal(Expr::word(U256::zero()));
        assert_eq!(e.depth(), 2);
        assert!(e.pretty_print_str().starts_with("Eq("));
        let mut vars = Vec::new();
        e.collect_vars(&mut vars);
        assert_eq!(vars, vec![("x".to_string(), VarKind::Unsigned(8))]);
    }
}
