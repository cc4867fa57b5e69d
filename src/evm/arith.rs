//! Pure 256-bit evaluators shared by the interpreter and the symbolic
//! executor. Signed operations use the two's-complement reading of a word.
use primitive_types::{U256, U512};

use crate::types::u256_be;

const SIGN_BIT: usize = 255;

pub fn is_neg(x: U256) -> bool {
    x.bit(SIGN_BIT)
}

pub fn twos_neg(x: U256) -> U256 {
    (!x).overflowing_add(U256::one()).0
}

pub fn add(a: U256, b: U256) -> U256 {
    a.overflowing_add(b).0
}

pub fn mul(a: U256, b: U256) -> U256 {
    a.overflowing_mul(b).0
}

pub fn sub(a: U256, b: U256) -> U256 {
    a.overflowing_sub(b).0
}

pub fn div(a: U256, b: U256) -> U256 {
    a.checked_div(b).unwrap_or_default()
}

pub fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let (na, nb) = (is_neg(a), is_neg(b));
    let ua = if na { twos_neg(a) } else { a };
    let ub = if nb { twos_neg(b) } else { b };
    let q = ua / ub;
    if na ^ nb {
        twos_neg(q)
    } else {
        q
    }
}

pub fn umod(a: U256, b: U256) -> U256 {
    a.checked_rem(b).unwrap_or_default()
}

pub fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let (na, nb) = (is_neg(a), is_neg(b));
    let ua = if na { twos_neg(a) } else { a };
    let ub = if nb { twos_neg(b) } else { b };
    let r = ua % ub;
    // result takes the sign of the dividend
    if na {
        twos_neg(r)
    } else {
        r
    }
}

pub fn addmod(a: U256, b: U256, m: U256) -> U256 {
    if m.is_zero() {
        return U256::zero();
    }
    let s = U512::from(a) + U512::from(b);
    U256::try_from(s % U512::from(m)).unwrap_or_default()
}

pub fn mulmod(a: U256, b: U256, m: U256) -> U256 {
    if m.is_zero() {
        return U256::zero();
    }
    U256::try_from(a.full_mul(b) % U512::from(m)).unwrap_or_default()
}

pub fn exp(a: U256, b: U256) -> U256 {
    a.overflowing_pow(b).0
}

pub fn signextend(k: U256, x: U256) -> U256 {
    if k >= U256::from(31u64) {
        return x;
    }
    let bit = k.low_u64() as usize * 8 + 7;
    let mask = (U256::one() << (bit + 1)) - U256::one();
    if x.bit(bit) {
        x | !mask
    } else {
        x & mask
    }
}

pub fn lt(a: U256, b: U256) -> U256 {
    bool_word(a < b)
}

pub fn gt(a: U256, b: U256) -> U256 {
    bool_word(a > b)
}

pub fn slt(a: U256, b: U256) -> U256 {
    bool_word(match (is_neg(a), is_neg(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    })
}

pub fn sgt(a: U256, b: U256) -> U256 {
    slt(b, a)
}

pub fn eq(a: U256, b: U256) -> U256 {
    bool_word(a == b)
}

pub fn iszero(a: U256) -> U256 {
    bool_word(a.is_zero())
}

pub fn byte(i: U256, x: U256) -> U256 {
    if i >= U256::from(32u64) {
        return U256::zero();
    }
    U256::from(u256_be(x)[i.low_u64() as usize])
}

pub fn shl(shift: U256, value: U256) -> U256 {
    if shift >= U256::from(256u64) {
        U256::zero()
    } else {
        value << shift.low_u64() as usize
    }
}

pub fn shr(shift: U256, value: U256) -> U256 {
    if shift >= U256::from(256u64) {
        U256::zero()
    } else {
        value >> shift.low_u64() as usize
    }
}

pub fn sar(shift: U256, value: U256) -> U256 {
    let neg = is_neg(value);
    if shift >= U256::from(256u64) {
        return if neg { U256::MAX } else { U256::zero() };
    }
    let n = shift.low_u64() as usize;
    let shifted = value >> n;
    if neg && n > 0 {
        // fill vacated high bits with ones
        shifted | (U256::MAX << (256 - n))
    } else {
        shifted
    }
}

fn bool_word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neg(v: u64) -> U256 {
        twos_neg(U256::from(v))
    }

    #[test]
    fn signed_division() {
        assert_eq!(sdiv(neg(6), U256::from(2u64)), neg(3));
        assert_eq!(sdiv(U256::from(6u64), neg(2)), neg(3));
        assert_eq!(sdiv(neg(6), neg(2)), U256::from(3u64));
        assert_eq!(sdiv(U256::from(6u64), U256::zero()), U256::zero());
    }

    #[test]
    fn signed_modulo_takes_dividend_sign() {
        assert_eq!(smod(neg(7), U256::from(3u64)), neg(1));
        assert_eq!(smod(U256::from(7u64), neg(3)), U256::from(1u64));
        assert_eq!(smod(U256::from(7u64), U256::zero()), U256::zero());
    }

    #[test]
    fn sign_extension() {
        // extend 0xff from byte 0 -> -1
        assert_eq!(signextend(U256::zero(), U256::from(0xffu64)), U256::MAX);
        assert_eq!(
            signextend(U256::zero(), U256::from(0x7fu64)),
            U256::from(0x7fu64)
        );
        // width >= 31 is the identity
        assert_eq!(
            signextend(U256::from(31u64), U256::from(0xffu64)),
            U256::from(0xffu64)
        );
    }

    #[test]
    fn arithmetic_shift() {
        assert_eq!(sar(U256::from(1u64), neg(4)), neg(2));
        assert_eq!(sar(U256::from(300u64), neg(4)), U256::MAX);
        assert_eq!(sar(U256::from(300u64), U256::from(4u64)), U256::zero());
        assert_eq!(
            sar(U256::from(2u64), U256::from(16u64)),
            U256::from(4u64)
        );
    }

    #[test]
    fn byte_selection_is_big_endian() {
        let x = U256::from_big_endian(&{
            let mut b = [0u8; 32];
            b[0] = 0xaa;
            b[31] = 0xbb;
            b
        });
        assert_eq!(byte(U256::zero(), x), U256::from(0xaau64));
        assert_eq!(byte(U256::from(31u64), x), U256::from(0xbbu64));
        assert_eq!(byte(U256::from(32u64), x), U256::zero());
    }

    #[test]
    fn mulmod_survives_wide_products() {
        let a = U256::MAX;
        assert_eq!(mulmod(a, a, U256::from(7u64)), (a % 7).pow(U256::from(2u64)) % 7);
        assert_eq!(mulmod(a, a, U256::zero()), U256::zero());
    }
}
