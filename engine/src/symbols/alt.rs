//! Alternative referenced types and their guard expressions.
//!
//! The source oracle observes that a pointer declared as one type is used
//! as another under a runtime-decidable condition and feeds the factory
//! `(target, candidate, guard)` tuples. Guards are small algebraic trees;
//! a leaf either folds to a constant, reads a value through the live
//! instance, yields the address of a global, or abstains.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::typeinfo::TypeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GuardOp {
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogicalAnd,
    LogicalOr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    Constant(i64),
    /// Read through the instance being navigated, e.g. `["f_op"]`.
    MemberChain(Vec<String>),
    /// Address of a named global variable.
    GlobalAddress(String),
    /// The oracle could not reduce this leaf; evaluation abstains.
    RuntimeDependent,
    Not(Box<GuardExpr>),
    Binary(GuardOp, Box<GuardExpr>, Box<GuardExpr>),
}

/// Read access into the live instance a guard is evaluated against.
pub trait GuardContext {
    /// Value of a member chain read from the current instance, as a sign-
    /// extended 64-bit integer (pointers read as unsigned bit patterns).
    fn member_chain_value(&self, chain: &[String]) -> Option<i64>;

    /// Address of a global variable by name.
    fn global_address(&self, name: &str) -> Option<u64>;
}

impl GuardExpr {
    /// Evaluates to `Some(value)` or abstains with `None`.
    pub fn eval(&self, ctx: &dyn GuardContext) -> Option<i64> {
        match self {
            GuardExpr::Constant(v) => Some(*v),
            GuardExpr::MemberChain(chain) => ctx.member_chain_value(chain),
            GuardExpr::GlobalAddress(name) => ctx.global_address(name).map(|a| a as i64),
            GuardExpr::RuntimeDependent => None,
            GuardExpr::Not(e) => e.eval(ctx).map(|v| (v == 0) as i64),
            GuardExpr::Binary(op, l, r) => {
                // Short-circuit forms abstain only if the deciding side does.
                match op {
                    GuardOp::LogicalAnd => {
                        let l = l.eval(ctx)?;
                        if l == 0 {
                            return Some(0);
                        }
                        r.eval(ctx).map(|r| (r != 0) as i64)
                    }
                    GuardOp::LogicalOr => {
                        let l = l.eval(ctx)?;
                        if l != 0 {
                            return Some(1);
                        }
                        r.eval(ctx).map(|r| (r != 0) as i64)
                    }
                    _ => {
                        let l = l.eval(ctx)?;
                        let r = r.eval(ctx)?;
                        Some(match op {
                            GuardOp::Add => l.wrapping_add(r),
                            GuardOp::Sub => l.wrapping_sub(r),
                            GuardOp::Mul => l.wrapping_mul(r),
                            GuardOp::BitAnd => l & r,
                            GuardOp::BitOr => l | r,
                            GuardOp::Eq => (l == r) as i64,
                            GuardOp::Ne => (l != r) as i64,
                            GuardOp::Lt => (l < r) as i64,
                            GuardOp::Le => (l <= r) as i64,
                            GuardOp::Gt => (l > r) as i64,
                            GuardOp::Ge => (l >= r) as i64,
                            GuardOp::LogicalAnd | GuardOp::LogicalOr => unreachable!(),
                        })
                    }
                }
            }
        }
    }

    /// True if the tree is a bare `Constant(_)` after no evaluation, the
    /// degenerate "always applies" guard.
    pub fn is_trivial(&self) -> bool {
        matches!(self, GuardExpr::Constant(_))
    }
}

/// One alternative for a pointer, member or variable. The declared type is
/// never replaced in the graph; candidates are consulted at navigation
/// time, in the priority order the oracle supplied them.
#[derive(Debug, Clone, PartialEq)]
pub struct AltRefType {
    pub ref_type_id: TypeId,
    pub guard: GuardExpr,
}

impl AltRefType {
    pub fn new(ref_type_id: TypeId, guard: GuardExpr) -> AltRefType {
        AltRefType { ref_type_id, guard }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCtx;

    impl GuardContext for FixedCtx {
        fn member_chain_value(&self, chain: &[String]) -> Option<i64> {
            match chain.first().map(String::as_str) {
                Some("f_op") => Some(0x1000),
                Some("flags") => Some(6),
                _ => None,
            }
        }

        fn global_address(&self, name: &str) -> Option<u64> {
            (name == "socket_file_ops").then_some(0x1000)
        }
    }

    fn chain(name: &str) -> GuardExpr {
        GuardExpr::MemberChain(vec![name.to_owned()])
    }

    #[test]
    fn guard_compares_member_to_global() {
        let g = GuardExpr::Binary(
            GuardOp::Eq,
            Box::new(chain("f_op")),
            Box::new(GuardExpr::GlobalAddress("socket_file_ops".into())),
        );
        assert_eq!(g.eval(&FixedCtx), Some(1));
    }

    #[test]
    fn runtime_dependent_abstains() {
        let g = GuardExpr::Binary(
            GuardOp::Eq,
            Box::new(GuardExpr::RuntimeDependent),
            Box::new(GuardExpr::Constant(1)),
        );
        assert_eq!(g.eval(&FixedCtx), None);
    }

    #[test]
    fn short_circuit_keeps_decided_value() {
        // false && <abstain> decides to false
        let g = GuardExpr::Binary(
            GuardOp::LogicalAnd,
            Box::new(GuardExpr::Constant(0)),
            Box::new(GuardExpr::RuntimeDependent),
        );
        assert_eq!(g.eval(&FixedCtx), Some(0));
        // true || <abstain> decides to true
        let g = GuardExpr::Binary(
            GuardOp::LogicalOr,
            Box::new(GuardExpr::Constant(1)),
            Box::new(GuardExpr::RuntimeDependent),
        );
        assert_eq!(g.eval(&FixedCtx), Some(1));
    }

    #[test]
    fn arithmetic_and_masking() {
        let g = GuardExpr::Binary(
            GuardOp::BitAnd,
            Box::new(chain("flags")),
            Box::new(GuardExpr::Constant(2)),
        );
        assert_eq!(g.eval(&FixedCtx), Some(2));
    }
}
