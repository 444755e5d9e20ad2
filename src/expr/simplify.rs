//! Local rewrite rules applied while nodes are constructed.
//!
//! Every rule here is an equivalence under EVM semantics. None of them is
//! required for soundness; they keep the path conditions handed to the
//! solver small.

use super::{BinaryOp, ExprBuilder, NodeKind, UnaryOp};
use crate::word::{Word, U256, WORD_BITS};

fn kind(w: &Word) -> Option<&NodeKind> {
    w.as_expr().map(|e| e.kind())
}

fn is(w: &Word, value: U256) -> bool {
    w.as_concrete() == Some(value)
}

fn small(w: &Word) -> Option<u32> {
    match w.as_concrete() {
        Some(c) if c < U256::from(WORD_BITS) => Some(c.as_u32()),
        _ => None,
    }
}

fn is_power_of_two(v: U256) -> Option<u32> {
    if v != U256::ZERO && v & v.wrapping_sub(U256::ONE) == U256::ZERO {
        Some(v.trailing_zeros())
    } else {
        None
    }
}

impl ExprBuilder {
    pub(super) fn simplify_unary(&mut self, op: UnaryOp, x: &Word) -> Option<Word> {
        match (op, kind(x)?) {
            // iszero(iszero(iszero(y))) == iszero(y)
            (UnaryOp::IsZero, NodeKind::Unary(UnaryOp::IsZero, inner)) => match inner.kind() {
                NodeKind::Unary(UnaryOp::IsZero, _) => Some(Word::from(inner.clone())),
                _ => None,
            },
            (UnaryOp::Not, NodeKind::Unary(UnaryOp::Not, inner)) => {
                Some(Word::from(inner.clone()))
            }
            _ => None,
        }
    }

    pub(super) fn simplify_binary(&mut self, op: BinaryOp, lhs: &Word, rhs: &Word) -> Option<Word> {
        if lhs == rhs {
            match op {
                BinaryOp::Sub | BinaryOp::Xor => return Some(Word::zero()),
                BinaryOp::Lt | BinaryOp::Gt | BinaryOp::SLt | BinaryOp::SGt => {
                    return Some(Word::zero())
                }
                BinaryOp::Eq => return Some(Word::one()),
                BinaryOp::And | BinaryOp::Or => return Some(lhs.clone()),
                _ => {}
            }
        }

        let zero = U256::ZERO;
        let one = U256::ONE;

        match op {
            BinaryOp::Add if is(lhs, zero) => Some(rhs.clone()),
            BinaryOp::Add if is(rhs, zero) => Some(lhs.clone()),
            BinaryOp::Sub if is(rhs, zero) => Some(lhs.clone()),
            BinaryOp::Mul if is(lhs, zero) || is(rhs, zero) => Some(Word::zero()),
            BinaryOp::Mul if is(lhs, one) => Some(rhs.clone()),
            BinaryOp::Mul if is(rhs, one) => Some(lhs.clone()),
            BinaryOp::Div | BinaryOp::SDiv if is(lhs, zero) || is(rhs, zero) => {
                Some(Word::zero())
            }
            BinaryOp::Div | BinaryOp::SDiv if is(rhs, one) => Some(lhs.clone()),
            BinaryOp::Div => {
                let k = rhs.as_concrete().and_then(is_power_of_two)?;
                Some(self.binary(BinaryOp::Shr, &Word::from(u64::from(k)), lhs))
            }
            BinaryOp::Mod | BinaryOp::SMod if is(rhs, zero) || is(rhs, one) => {
                Some(Word::zero())
            }
            BinaryOp::Exp if is(rhs, zero) => Some(Word::one()),
            BinaryOp::Exp if is(rhs, one) => Some(lhs.clone()),
            BinaryOp::And if is(lhs, zero) || is(rhs, zero) => Some(Word::zero()),
            BinaryOp::And if is(lhs, U256::MAX) => Some(rhs.clone()),
            BinaryOp::And if is(rhs, U256::MAX) => Some(lhs.clone()),
            BinaryOp::And if is(lhs, one) && rhs.as_expr().map_or(false, |e| e.is_boolean()) => {
                Some(rhs.clone())
            }
            BinaryOp::And if is(rhs, one) && lhs.as_expr().map_or(false, |e| e.is_boolean()) => {
                Some(lhs.clone())
            }
            BinaryOp::Or | BinaryOp::Xor if is(lhs, zero) => Some(rhs.clone()),
            BinaryOp::Or | BinaryOp::Xor if is(rhs, zero) => Some(lhs.clone()),
            BinaryOp::Eq if is(lhs, zero) => Some(self.iszero(rhs)),
            BinaryOp::Eq if is(rhs, zero) => Some(self.iszero(lhs)),
            BinaryOp::Lt if is(rhs, zero) || is(lhs, U256::MAX) => Some(Word::zero()),
            BinaryOp::Gt if is(lhs, zero) || is(rhs, U256::MAX) => Some(Word::zero()),
            BinaryOp::Byte if lhs.as_concrete().map_or(false, |i| i >= U256::from(32_u64)) => {
                Some(Word::zero())
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Sar => self.simplify_shift(op, lhs, rhs),
            _ => None,
        }
    }

    fn simplify_shift(&mut self, op: BinaryOp, shift: &Word, value: &Word) -> Option<Word> {
        if is(shift, U256::ZERO) {
            return Some(value.clone());
        }

        if op != BinaryOp::Sar && (is(value, U256::ZERO) || (shift.is_concrete() && small(shift).is_none())) {
            return Some(Word::zero());
        }

        let k = small(shift)?;

        match (op, kind(value)?) {
            (BinaryOp::Shl, NodeKind::Binary(BinaryOp::Or, a, b))
            | (BinaryOp::Shr, NodeKind::Binary(BinaryOp::Or, a, b)) => {
                let (a, b) = (Word::from(a.clone()), Word::from(b.clone()));
                let a = self.binary(op, shift, &a);
                let b = self.binary(op, shift, &b);

                Some(self.or(&a, &b))
            }
            (outer, NodeKind::Binary(inner, inner_shift, x))
                if (outer == BinaryOp::Shl || outer == BinaryOp::Shr)
                    && (*inner == BinaryOp::Shl || *inner == BinaryOp::Shr) =>
            {
                let j = small(&Word::from(inner_shift.clone()))?;
                let x = Word::from(x.clone());

                if outer == *inner {
                    let total = u64::from(k) + u64::from(j);

                    Some(self.binary(outer, &Word::from(total), &x))
                } else if k == j {
                    let mask = if outer == BinaryOp::Shr {
                        U256::MAX >> k
                    } else {
                        U256::MAX << k
                    };

                    Some(self.and(&x, &Word::from(mask)))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
