//! 256-bit machine words.
//!
//! A [`Word`] is either a concrete 256-bit integer or a reference into the
//! expression graph. All concrete arithmetic is performed modulo 2^256 and
//! follows the EVM's definitions, which means division or modulo by zero
//! yields zero and nothing in here ever panics.

use crate::expr::{Expr, NodeKind};
pub use ethnum::U256;
use std::fmt;

pub const WORD_BYTES: usize = 32;
pub const WORD_BITS: u32 = 256;

const SIGN_BIT: U256 = U256::from_words(1_u128 << 127, 0);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Word {
    Concrete(U256),
    Symbolic(Expr),
}

impl Word {
    pub const fn zero() -> Self {
        Word::Concrete(U256::ZERO)
    }

    pub const fn one() -> Self {
        Word::Concrete(U256::ONE)
    }

    pub fn from_bool(b: bool) -> Self {
        Word::Concrete(from_bool(b))
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Word::Concrete(_))
    }

    pub fn as_concrete(&self) -> Option<U256> {
        match self {
            Word::Concrete(c) => Some(*c),
            Word::Symbolic(_) => None,
        }
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            Word::Concrete(_) => None,
            Word::Symbolic(e) => Some(e),
        }
    }
}

impl From<U256> for Word {
    fn from(value: U256) -> Self {
        Word::Concrete(value)
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Word::Concrete(U256::from(value))
    }
}

// constants are never wrapped as symbolic words
impl From<Expr> for Word {
    fn from(expr: Expr) -> Self {
        match expr.kind() {
            NodeKind::Constant(c) => Word::Concrete(*c),
            _ => Word::Symbolic(expr),
        }
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Word::Concrete(c) => write!(f, "{:#x}", c),
            Word::Symbolic(e) => write!(f, "{}", e),
        }
    }
}

pub fn from_bool(b: bool) -> U256 {
    if b {
        U256::ONE
    } else {
        U256::ZERO
    }
}

pub fn to_u64(v: U256) -> Option<u64> {
    let (high, low) = v.into_words();

    if high == 0 && low <= u128::from(u64::MAX) {
        Some(low as u64)
    } else {
        None
    }
}

pub fn to_usize(v: U256) -> Option<usize> {
    to_u64(v).and_then(|v| usize::try_from(v).ok())
}

fn is_negative(v: U256) -> bool {
    v & SIGN_BIT != U256::ZERO
}

fn negate(v: U256) -> U256 {
    (!v).wrapping_add(U256::ONE)
}

fn abs(v: U256) -> U256 {
    if is_negative(v) {
        negate(v)
    } else {
        v
    }
}

pub fn add(a: U256, b: U256) -> U256 {
    a.wrapping_add(b)
}

pub fn sub(a: U256, b: U256) -> U256 {
    a.wrapping_sub(b)
}

pub fn mul(a: U256, b: U256) -> U256 {
    a.wrapping_mul(b)
}

pub fn div(a: U256, b: U256) -> U256 {
    if b == U256::ZERO {
        U256::ZERO
    } else {
        a / b
    }
}

pub fn rem(a: U256, b: U256) -> U256 {
    if b == U256::ZERO {
        U256::ZERO
    } else {
        a % b
    }
}

pub fn sdiv(a: U256, b: U256) -> U256 {
    if b == U256::ZERO {
        return U256::ZERO;
    }

    let quotient = abs(a) / abs(b);

    if is_negative(a) != is_negative(b) {
        negate(quotient)
    } else {
        quotient
    }
}

pub fn smod(a: U256, b: U256) -> U256 {
    if b == U256::ZERO {
        return U256::ZERO;
    }

    let remainder = abs(a) % abs(b);

    if is_negative(a) {
        negate(remainder)
    } else {
        remainder
    }
}

pub fn addmod(a: U256, b: U256, n: U256) -> U256 {
    if n == U256::ZERO {
        return U256::ZERO;
    }

    let (a, b) = (a % n, b % n);
    let (sum, overflow) = a.overflowing_add(b);

    if overflow || sum >= n {
        sum.wrapping_sub(n)
    } else {
        sum
    }
}

pub fn mulmod(a: U256, b: U256, n: U256) -> U256 {
    if n == U256::ZERO {
        return U256::ZERO;
    }

    let a = a % n;

    (0..WORD_BITS).rev().fold(U256::ZERO, |acc, bit| {
        let doubled = addmod(acc, acc, n);

        if (b >> bit) & U256::ONE == U256::ONE {
            addmod(doubled, a, n)
        } else {
            doubled
        }
    })
}

pub fn exp(base: U256, exponent: U256) -> U256 {
    let mut result = U256::ONE;
    let mut base = base;
    let mut exponent = exponent;

    while exponent != U256::ZERO {
        if exponent & U256::ONE == U256::ONE {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exponent = exponent >> 1_u32;
    }

    result
}

pub fn signextend(b: U256, x: U256) -> U256 {
    match to_u64(b) {
        Some(b) if b < 31 => {
            let bit = (b as u32) * 8 + 7;
            let mask = (U256::ONE << (bit + 1)).wrapping_sub(U256::ONE);

            if (x >> bit) & U256::ONE == U256::ONE {
                x | !mask
            } else {
                x & mask
            }
        }
        _ => x,
    }
}

pub fn lt(a: U256, b: U256) -> U256 {
    from_bool(a < b)
}

pub fn gt(a: U256, b: U256) -> U256 {
    from_bool(a > b)
}

pub fn slt(a: U256, b: U256) -> U256 {
    from_bool((a ^ SIGN_BIT) < (b ^ SIGN_BIT))
}

pub fn sgt(a: U256, b: U256) -> U256 {
    from_bool((a ^ SIGN_BIT) > (b ^ SIGN_BIT))
}

pub fn eq(a: U256, b: U256) -> U256 {
    from_bool(a == b)
}

pub fn iszero(a: U256) -> U256 {
    from_bool(a == U256::ZERO)
}

pub fn and(a: U256, b: U256) -> U256 {
    a & b
}

pub fn or(a: U256, b: U256) -> U256 {
    a | b
}

pub fn xor(a: U256, b: U256) -> U256 {
    a ^ b
}

pub fn not(a: U256) -> U256 {
    !a
}

pub fn byte(i: U256, x: U256) -> U256 {
    match to_u64(i) {
        Some(i) if i < WORD_BYTES as u64 => (x >> (8 * (31 - i as u32))) & U256::from(0xff_u64),
        _ => U256::ZERO,
    }
}

pub fn shl(shift: U256, value: U256) -> U256 {
    match to_u64(shift) {
        Some(s) if s < u64::from(WORD_BITS) => value << (s as u32),
        _ => U256::ZERO,
    }
}

pub fn shr(shift: U256, value: U256) -> U256 {
    match to_u64(shift) {
        Some(s) if s < u64::from(WORD_BITS) => value >> (s as u32),
        _ => U256::ZERO,
    }
}

pub fn sar(shift: U256, value: U256) -> U256 {
    let negative = is_negative(value);

    match to_u64(shift) {
        Some(s) if s < u64::from(WORD_BITS) => {
            if negative {
                !((!value) >> (s as u32))
            } else {
                value >> (s as u32)
            }
        }
        _ => {
            if negative {
                U256::MAX
            } else {
                U256::ZERO
            }
        }
    }
}

/// Mask that keeps the big-endian bytes `first..=last` of a word.
pub fn byte_mask(first: usize, last: usize) -> U256 {
    (first..=last.min(WORD_BYTES - 1)).fold(U256::ZERO, |mask, i| {
        mask | (U256::from(0xff_u64) << (8 * (31 - i as u32)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn addition_wraps_at_word_width() {
        assert_eq!(add(U256::MAX, U256::ONE), U256::ZERO);
        assert_eq!(add(U256::MAX, U256::MAX), U256::MAX - U256::ONE);
        assert_eq!(sub(U256::ZERO, U256::ONE), U256::MAX);
        assert_eq!(mul(U256::MAX, u(2)), U256::MAX - U256::ONE);
        assert_eq!(mul(SIGN_BIT, u(2)), U256::ZERO);
    }

    #[test]
    fn division_by_zero_yields_zero() {
        assert_eq!(div(u(10), U256::ZERO), U256::ZERO);
        assert_eq!(rem(u(10), U256::ZERO), U256::ZERO);
        assert_eq!(sdiv(u(10), U256::ZERO), U256::ZERO);
        assert_eq!(smod(u(10), U256::ZERO), U256::ZERO);
        assert_eq!(addmod(u(1), u(2), U256::ZERO), U256::ZERO);
        assert_eq!(mulmod(u(1), u(2), U256::ZERO), U256::ZERO);
        assert_eq!(div(u(10), u(3)), u(3));
        assert_eq!(rem(u(10), u(3)), u(1));
    }

    #[test]
    fn signed_division_uses_twos_complement() {
        let minus_one = U256::MAX;
        let minus_ten = negate(u(10));

        assert_eq!(sdiv(minus_ten, u(3)), negate(u(3)));
        assert_eq!(sdiv(minus_ten, minus_one), u(10));
        assert_eq!(sdiv(SIGN_BIT, minus_one), SIGN_BIT);
        assert_eq!(smod(minus_ten, u(3)), negate(u(1)));
        assert_eq!(smod(u(10), negate(u(3))), u(1));
    }

    #[test]
    fn modular_arithmetic_is_computed_without_intermediate_overflow() {
        assert_eq!(addmod(U256::MAX, U256::MAX, u(7)), (U256::MAX % u(7) * u(2)) % u(7));
        assert_eq!(addmod(u(10), u(10), u(8)), u(4));
        assert_eq!(mulmod(U256::MAX, U256::MAX, u(12)), u(9));
        assert_eq!(mulmod(u(10), u(10), u(8)), u(4));
    }

    #[test]
    fn exponentiation_wraps() {
        assert_eq!(exp(u(2), u(8)), u(256));
        assert_eq!(exp(u(2), u(256)), U256::ZERO);
        assert_eq!(exp(u(2), u(255)), SIGN_BIT);
        assert_eq!(exp(u(0), u(0)), U256::ONE);
        assert_eq!(exp(U256::MAX, u(2)), U256::ONE);
    }

    #[test]
    fn comparisons_distinguish_signedness() {
        assert_eq!(lt(u(1), u(2)), U256::ONE);
        assert_eq!(gt(u(1), u(2)), U256::ZERO);
        assert_eq!(lt(U256::MAX, u(1)), U256::ZERO);
        assert_eq!(slt(U256::MAX, u(1)), U256::ONE);
        assert_eq!(sgt(u(1), U256::MAX), U256::ONE);
        assert_eq!(eq(u(5), u(5)), U256::ONE);
        assert_eq!(iszero(U256::ZERO), U256::ONE);
    }

    #[test]
    fn shifts_beyond_the_word_width_saturate() {
        assert_eq!(shl(u(1), u(1)), u(2));
        assert_eq!(shl(u(256), u(1)), U256::ZERO);
        assert_eq!(shr(u(256), U256::MAX), U256::ZERO);
        assert_eq!(shr(U256::MAX, U256::MAX), U256::ZERO);
        assert_eq!(sar(u(4), negate(u(16))), negate(u(1)));
        assert_eq!(sar(u(300), SIGN_BIT), U256::MAX);
        assert_eq!(sar(u(300), u(7)), U256::ZERO);
    }

    #[test]
    fn byte_and_signextend_select_big_endian_bytes() {
        let x = U256::from(0x1122_u64);

        assert_eq!(byte(u(31), x), u(0x22));
        assert_eq!(byte(u(30), x), u(0x11));
        assert_eq!(byte(u(32), x), U256::ZERO);
        assert_eq!(signextend(u(0), u(0xff)), U256::MAX);
        assert_eq!(signextend(u(0), u(0x7f)), u(0x7f));
        assert_eq!(signextend(u(1), u(0x1_80ff)), negate(u(0x7f01)));
        assert_eq!(signextend(u(31), u(0xff)), u(0xff));
    }

    #[test]
    fn byte_masks_cover_requested_range() {
        assert_eq!(byte_mask(31, 31), u(0xff));
        assert_eq!(byte_mask(30, 31), u(0xffff));
        assert_eq!(byte_mask(0, 31), U256::MAX);
    }
}
