/// Common word/address types shared across the fuzzer
use primitive_types::{H160, H256, U256};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Keccak256};

pub type EVMAddress = H160;
pub type EVMU256 = U256;

/// Check is EVMU256 is zero
pub fn is_zero(v: EVMU256) -> bool {
    v.is_zero()
}

/// As u64 (truncating)
pub fn as_u64(v: EVMU256) -> u64 {
    v.low_u64()
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Big-endian 32-byte rendering of a word
pub fn u256_be(v: EVMU256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    buf
}

/// Word from up to 32 big-endian bytes (right-aligned)
pub fn u256_from_be(bytes: &[u8]) -> EVMU256 {
    let mut buf = [0u8; 32];
    let n = bytes.len().min(32);
    buf[32 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    U256::from_big_endian(&buf)
}

/// Convert U256 to H160 by taking the last 20 bytes
pub fn u256_to_address(v: EVMU256) -> EVMAddress {
    let data = u256_be(v);
    EVMAddress::from_slice(&data[12..32])
}

pub fn address_to_u256(a: EVMAddress) -> EVMU256 {
    u256_from_be(a.as_bytes())
}

pub fn h256_from_u256(v: EVMU256) -> H256 {
    H256(u256_be(v))
}

/// Generate a fixed H160 address from a hex string (no 0x prefix).
pub fn fixed_address(s: &str) -> EVMAddress {
    let mut address = EVMAddress::zero();
    address
        .0
        .copy_from_slice(&hex::decode(s).expect("bad fixed address literal"));
    address
}

/// Parse a word from decimal, `0x` hex or the solver's `#x` hex rendering.
pub fn parse_u256(s: &str) -> Option<EVMU256> {
    let s = s.trim();
    if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("#x")) {
        return U256::from_str_radix(h, 16).ok();
    }
    if let Some(b) = s.strip_prefix("#b") {
        return U256::from_str_radix(b, 2).ok();
    }
    U256::from_dec_str(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trips_through_bytes() {
        let v = U256::from(0xdeadbeefu64);
        assert_eq!(u256_from_be(&u256_be(v)), v);
        assert_eq!(u256_from_be(&[0xde, 0xad]), U256::from(0xdeadu64));
    }

    #[test]
    fn parses_solver_and_human_renderings() {
        assert_eq!(parse_u256("42"), Some(U256::from(42u64)));
        assert_eq!(parse_u256("0x2a"), Some(U256::from(42u64)));
        assert_eq!(parse_u256("#x2a"), Some(U256::from(42u64)));
        assert_eq!(parse_u256("#b101010"), Some(U256::from(42u64)));
        assert_eq!(parse_u256("not a number"), None);
    }

    #[test]
    fn address_word_conversion_truncates_high_bytes() {
        let a = fixed_address("1111111111111111111111111111111111111111");
        assert_eq!(u256_to_address(address_to_u256(a)), a);
    }
}
