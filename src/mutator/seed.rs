//! Typed seed values. A vault's base seed fixes the type; every seed in the
//! vault renders, parses and hashes through the same shape.
use std::fmt;

use primitive_types::U256;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::evm::abi::SolType;
use crate::evm::arith;
use crate::types::{parse_u256, u256_from_be, u256_to_address, EVMAddress, EVMU256};

/// Priority at which a seed counts as retired. The transition is one-way:
/// once clamped the priority only ever decreases.
pub const RETIRED_PRIORITY: i64 = -1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SeedValue {
    /// value and declared bit width
    Uint(EVMU256, usize),
    /// two's-complement value and declared bit width
    Int(EVMU256, usize),
    Bool(bool),
    Address(EVMAddress),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    Str(String),
}

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn mask_bits(v: EVMU256, bits: usize) -> EVMU256 {
    if bits >= 256 {
        v
    } else {
        v & ((EVMU256::one() << bits) - EVMU256::one())
    }
}

impl SeedValue {
    /// Zero-valued prototype carrying the argument's type.
    pub fn base_for(ty: &SolType) -> SeedValue {
        match ty {
            SolType::Uint(n) => SeedValue::Uint(EVMU256::zero(), *n),
            SolType::Int(n) => SeedValue::Int(EVMU256::zero(), *n),
            SolType::Bool => SeedValue::Bool(false),
            SolType::Address => SeedValue::Address(EVMAddress::zero()),
            SolType::FixedBytes(n) => SeedValue::FixedBytes(vec![0u8; *n]),
            SolType::Bytes => SeedValue::Bytes(Vec::new()),
            SolType::Str => SeedValue::Str(String::new()),
        }
    }

    /// Fresh random value of the same shape as `self`. Wide integers draw a
    /// 64-bit random the way narrow ones fill their own width; magnitudes
    /// stay in a range arithmetic over them keeps meaning.
    pub fn random_like(&self, rng: &mut impl Rng) -> SeedValue {
        match self {
            SeedValue::Uint(_, bits) => {
                let raw = U256::from(rng.gen::<u64>());
                SeedValue::Uint(mask_bits(raw, (*bits).min(64)), *bits)
            }
            SeedValue::Int(_, bits) => {
                let raw = mask_bits(U256::from(rng.gen::<u64>()), (*bits).min(64));
                SeedValue::Int(sign_extend_to_word(raw, (*bits).min(64)), *bits)
            }
            SeedValue::Bool(_) => SeedValue::Bool(rng.gen()),
            SeedValue::Address(_) => {
                let mut b = [0u8; 20];
                rng.fill(&mut b[..]);
                SeedValue::Address(EVMAddress::from(b))
            }
            SeedValue::FixedBytes(old) => {
                let mut b = vec![0u8; old.len()];
                rng.fill(&mut b[..]);
                SeedValue::FixedBytes(b)
            }
            SeedValue::Bytes(_) => {
                let n = rng.gen_range(0..32);
                let mut b = vec![0u8; n];
                rng.fill(&mut b[..]);
                SeedValue::Bytes(b)
            }
            SeedValue::Str(_) => {
                let n = rng.gen_range(0..32);
                let s: String = (0..n)
                    .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                    .collect();
                SeedValue::Str(s)
            }
        }
    }

    /// Parse a textual rendering (decimal, `0x`/`#x` hex, or raw) into a
    /// value of the same shape as `self`.
    pub fn parse_like(&self, s: &str) -> Option<SeedValue> {
        let s = s.trim();
        match self {
            SeedValue::Uint(_, bits) => parse_u256(s).map(|v| SeedValue::Uint(mask_bits(v, *bits), *bits)),
            SeedValue::Int(_, bits) => {
                let v = if let Some(body) = s.strip_prefix('-') {
                    parse_u256(body).map(arith::twos_neg)
                } else {
                    parse_u256(s)
                }?;
                Some(SeedValue::Int(
                    sign_extend_to_word(mask_bits(v, *bits), *bits),
                    *bits,
                ))
            }
            SeedValue::Bool(_) => match s {
                "true" | "1" => Some(SeedValue::Bool(true)),
                "false" | "0" => Some(SeedValue::Bool(false)),
                _ => parse_u256(s).map(|v| SeedValue::Bool(!v.is_zero())),
            },
            SeedValue::Address(_) => {
                let v = parse_u256(s)?;
                Some(SeedValue::Address(u256_to_address(v)))
            }
            SeedValue::FixedBytes(old) => {
                let n = old.len();
                if let Some(hexed) = s.strip_prefix("0x").or_else(|| s.strip_prefix("#x")) {
                    let mut raw = hex::decode(hexed).ok()?;
                    raw.resize(n, 0);
                    return Some(SeedValue::FixedBytes(raw));
                }
                let v = parse_u256(s)?;
                Some(SeedValue::FixedBytes(
                    crate::types::u256_be(v)[..n.min(32)].to_vec(),
                ))
            }
            SeedValue::Bytes(_) => {
                if let Some(hexed) = s.strip_prefix("0x").or_else(|| s.strip_prefix("#x")) {
                    return hex::decode(hexed).ok().map(SeedValue::Bytes);
                }
                Some(SeedValue::Bytes(s.as_bytes().to_vec()))
            }
            SeedValue::Str(_) => Some(SeedValue::Str(s.to_string())),
        }
    }

    /// Canonical bytes fed to the seed hash.
    pub fn hash_bytes(&self) -> Vec<u8> {
        match self {
            SeedValue::Uint(v, _) | SeedValue::Int(v, _) => crate::types::u256_be(*v).to_vec(),
            SeedValue::Bool(b) => vec![*b as u8],
            SeedValue::Address(a) => a.as_bytes().to_vec(),
            SeedValue::FixedBytes(b) | SeedValue::Bytes(b) => b.clone(),
            SeedValue::Str(s) => s.as_bytes().to_vec(),
        }
    }

    /// The word this value packs to (left-aligned for fixed bytes), used for
    /// solver exclusions.
    pub fn to_u256(&self) -> EVMU256 {
        match self {
            SeedValue::Uint(v, _) | SeedValue::Int(v, _) => *v,
            SeedValue::Bool(b) => EVMU256::from(*b as u64),
            SeedValue::Address(a) => crate::types::address_to_u256(*a),
            SeedValue::FixedBytes(b) => {
                let mut w = [0u8; 32];
                let take = b.len().min(32);
                w[..take].copy_from_slice(&b[..take]);
                EVMU256::from_big_endian(&w)
            }
            SeedValue::Bytes(b) => {
                let take = b.len().min(32);
                u256_from_be(&b[..take])
            }
            SeedValue::Str(s) => u256_from_be(&s.as_bytes()[..s.len().min(32)]),
        }
    }
}

fn sign_extend_to_word(v: EVMU256, bits: usize) -> EVMU256 {
    if bits >= 256 {
        return v;
    }
    arith::signextend(EVMU256::from(bits / 8 - 1), v)
}

impl fmt::Display for SeedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedValue::Uint(v, _) => write!(f, "{v}"),
            SeedValue::Int(v, _) => {
                if arith::is_neg(*v) {
                    write!(f, "-{}", arith::twos_neg(*v))
                } else {
                    write!(f, "{v}")
                }
            }
            SeedValue::Bool(b) => write!(f, "{b}"),
            SeedValue::Address(a) => write!(f, "0x{}", hex::encode(a.as_bytes())),
            SeedValue::FixedBytes(b) | SeedValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            SeedValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub value: SeedValue,
    pub priority: i64,
}

impl Seed {
    pub fn new(value: SeedValue) -> Self {
        Self { value, priority: 0 }
    }

    pub fn is_retired(&self) -> bool {
        self.priority <= RETIRED_PRIORITY
    }

    /// One-way retirement: clamp to the retired priority, then keep sinking.
    pub fn drop_priority(&mut self) {
        if self.priority > RETIRED_PRIORITY {
            self.priority = RETIRED_PRIORITY;
        } else {
            self.priority -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_follows_the_base_type() {
        let base = SeedValue::Uint(EVMU256::zero(), 8);
        assert_eq!(
            base.parse_like("300"),
            Some(SeedValue::Uint(EVMU256::from(300u64 & 0xff), 8))
        );
        let base = SeedValue::Int(EVMU256::zero(), 256);
        assert_eq!(
            base.parse_like("-2"),
            Some(SeedValue::Int(arith::twos_neg(EVMU256::from(2u64)), 256))
        );
        let base = SeedValue::Bool(false);
        assert_eq!(base.parse_like("1"), Some(SeedValue::Bool(true)));
    }

    #[test]
    fn solver_hex_parses_into_addresses() {
        let base = SeedValue::Address(EVMAddress::zero());
        let got = base.parse_like("#x0000000000000000000000001111111111111111111111111111111111111111");
        assert_eq!(
            got,
            Some(SeedValue::Address(crate::types::fixed_address(
                "1111111111111111111111111111111111111111"
            )))
        );
    }

    #[test]
    fn drop_clamps_then_sinks() {
        let mut s = Seed::new(SeedValue::Bool(true));
        s.priority = 5;
        s.drop_priority();
        assert_eq!(s.priority, RETIRED_PRIORITY);
        s.drop_priority();
        assert_eq!(s.priority, RETIRED_PRIORITY - 1);
        assert!(s.is_retired());
    }

    #[test]
    fn fixed_bytes_pack_left_aligned() {
        let v = SeedValue::FixedBytes(vec![0xab, 0xcd]);
        let w = crate::types::u256_be(v.to_u256());
        assert_eq!(&w[..2], &[0xab, 0xcd]);
        assert_eq!(w[31], 0);
    }
}
