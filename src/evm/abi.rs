//! Minimal ABI handling: parse the JSON description of a contract's public
//! surface, compute selectors, and pack typed argument values into calldata.
use serde_json::Value;
use thiserror::Error;

use crate::mutator::seed::SeedValue;
use crate::types::{keccak256, u256_be, EVMU256};

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("failed to parse abi json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported solidity type: {0}")]
    UnsupportedType(String),
    #[error("argument count mismatch: want {want}, got {got}")]
    ArgCount { want: usize, got: usize },
    #[error("argument {index} does not fit its declared type")]
    TypeMismatch { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolType {
    Uint(usize),
    Int(usize),
    Bool,
    Address,
    FixedBytes(usize),
    Bytes,
    Str,
}

impl SolType {
    pub fn parse(s: &str) -> Result<SolType, AbiError> {
        // dynamic containers degrade to raw bytes; their elements are not
        // mutated individually
        if s.ends_with(']') || s.starts_with("tuple") {
            return Ok(SolType::Bytes);
        }
        match s {
            "bool" => return Ok(SolType::Bool),
            "address" => return Ok(SolType::Address),
            "bytes" => return Ok(SolType::Bytes),
            "string" => return Ok(SolType::Str),
            "uint" => return Ok(SolType::Uint(256)),
            "int" => return Ok(SolType::Int(256)),
            "function" => return Ok(SolType::FixedBytes(24)),
            _ => {}
        }
        if let Some(bits) = s.strip_prefix("uint") {
            let n: usize = bits
                .parse()
                .map_err(|_| AbiError::UnsupportedType(s.to_string()))?;
            if n == 0 || n > 256 || n % 8 != 0 {
                return Err(AbiError::UnsupportedType(s.to_string()));
            }
            return Ok(SolType::Uint(n));
        }
        if let Some(bits) = s.strip_prefix("int") {
            let n: usize = bits
                .parse()
                .map_err(|_| AbiError::UnsupportedType(s.to_string()))?;
            if n == 0 || n > 256 || n % 8 != 0 {
                return Err(AbiError::UnsupportedType(s.to_string()));
            }
            return Ok(SolType::Int(n));
        }
        if let Some(len) = s.strip_prefix("bytes") {
            let n: usize = len
                .parse()
                .map_err(|_| AbiError::UnsupportedType(s.to_string()))?;
            if n == 0 || n > 32 {
                return Err(AbiError::UnsupportedType(s.to_string()));
            }
            return Ok(SolType::FixedBytes(n));
        }
        Err(AbiError::UnsupportedType(s.to_string()))
    }

    pub fn canonical(&self) -> String {
        match self {
            SolType::Uint(n) => format!("uint{n}"),
            SolType::Int(n) => format!("int{n}"),
            SolType::Bool => "bool".to_string(),
            SolType::Address => "address".to_string(),
            SolType::FixedBytes(n) => format!("bytes{n}"),
            SolType::Bytes => "bytes".to_string(),
            SolType::Str => "string".to_string(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, SolType::Bytes | SolType::Str)
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: SolType,
    /// the raw type string from the json, kept for signatures
    pub type_str: String,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub inputs: Vec<Param>,
    pub state_mutability: String,
}

impl Method {
    pub fn signature(&self) -> String {
        let args: Vec<&str> = self.inputs.iter().map(|p| p.type_str.as_str()).collect();
        format!("{}({})", self.name, args.join(","))
    }

    pub fn selector(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out.copy_from_slice(&keccak256(self.signature().as_bytes())[..4]);
        out
    }

    pub fn is_view(&self) -> bool {
        self.state_mutability == "view" || self.state_mutability == "pure"
    }

    pub fn is_payable(&self) -> bool {
        self.state_mutability == "payable"
    }

    /// `<method>:<type>_<name>`, the contract-level vault namespace.
    pub fn vault_name(&self, index: usize) -> String {
        let p = &self.inputs[index];
        format!("{}:{}_{}", self.name, p.ty.canonical(), p.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Abi {
    pub methods: Vec<Method>,
    pub constructor: Option<Method>,
}

impl Abi {
    pub fn parse_str(data: &str) -> Result<Abi, AbiError> {
        let json: Vec<Value> = serde_json::from_str(data)?;
        let mut methods = Vec::new();
        let mut constructor = None;
        for entry in &json {
            let kind = entry["type"].as_str().unwrap_or("function");
            if kind != "function" && kind != "constructor" {
                continue;
            }
            let name = if kind == "constructor" {
                String::new()
            } else {
                match entry["name"].as_str() {
                    Some(n) => n.to_string(),
                    None => continue,
                }
            };
            let mut inputs = Vec::new();
            if let Some(params) = entry["inputs"].as_array() {
                for (i, p) in params.iter().enumerate() {
                    let type_str = p["type"].as_str().unwrap_or("bytes").to_string();
                    inputs.push(Param {
                        name: p["name"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| format!("arg{i}")),
                        ty: SolType::parse(&type_str)?,
                        type_str,
                    });
                }
            }
            let method = Method {
                name,
                inputs,
                state_mutability: entry["stateMutability"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            };
            if kind == "constructor" {
                constructor = Some(method);
            } else {
                methods.push(method);
            }
        }
        Ok(Abi {
            methods,
            constructor,
        })
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name.clone()).collect()
    }
}

/// The 32-byte head word for a value: the value itself for static types, or
/// a tail offset (filled by the caller) for dynamic ones.
fn head_word(ty: &SolType, value: &SeedValue, index: usize) -> Result<[u8; 32], AbiError> {
    let word = match (ty, value) {
        (SolType::Uint(_), SeedValue::Uint(v, _)) => u256_be(*v),
        (SolType::Int(_), SeedValue::Int(v, _)) => u256_be(*v),
        (SolType::Bool, SeedValue::Bool(b)) => {
            u256_be(if *b { EVMU256::one() } else { EVMU256::zero() })
        }
        (SolType::Address, SeedValue::Address(a)) => {
            let mut w = [0u8; 32];
            w[12..].copy_from_slice(a.as_bytes());
            w
        }
        (SolType::FixedBytes(n), SeedValue::FixedBytes(b)) => {
            let mut w = [0u8; 32];
            let take = b.len().min(*n).min(32);
            w[..take].copy_from_slice(&b[..take]);
            w
        }
        _ => return Err(AbiError::TypeMismatch { index }),
    };
    Ok(word)
}

fn tail_bytes(value: &SeedValue) -> Option<Vec<u8>> {
    let raw = match value {
        SeedValue::Bytes(b) => b.clone(),
        SeedValue::Str(s) => s.as_bytes().to_vec(),
        _ => return None,
    };
    let mut out = u256_be(EVMU256::from(raw.len())).to_vec();
    out.extend_from_slice(&raw);
    let pad = (32 - raw.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(pad));
    Some(out)
}

/// Pack arguments with the static-head / dynamic-tail layout.
pub fn encode_args(inputs: &[Param], values: &[SeedValue]) -> Result<Vec<u8>, AbiError> {
    if inputs.len() != values.len() {
        return Err(AbiError::ArgCount {
            want: inputs.len(),
            got: values.len(),
        });
    }
    let head_size = 32 * inputs.len();
    let mut head = Vec::with_capacity(head_size);
    let mut tail: Vec<u8> = Vec::new();
    for (i, (p, v)) in inputs.iter().zip(values).enumerate() {
        if p.ty.is_dynamic() {
            let offset = EVMU256::from(head_size + tail.len());
            head.extend_from_slice(&u256_be(offset));
            let bytes = tail_bytes(v).ok_or(AbiError::TypeMismatch { index: i })?;
            tail.extend_from_slice(&bytes);
        } else {
            head.extend_from_slice(&head_word(&p.ty, v, i)?);
        }
    }
    head.extend_from_slice(&tail);
    Ok(head)
}

/// selector ++ packed arguments
pub fn encode_call(method: &Method, values: &[SeedValue]) -> Result<Vec<u8>, AbiError> {
    let mut out = method.selector().to_vec();
    out.extend_from_slice(&encode_args(&method.inputs, values)?);
    Ok(out)
}

/// Per-argument binding layout for the register pool: vault name, the packed
/// head word, signedness and bit width.
pub fn bind_layout(
    method: &Method,
    values: &[SeedValue],
) -> Result<Vec<(String, EVMU256, bool, usize)>, AbiError> {
    let head_size = 32 * method.inputs.len();
    let mut tail_len = 0usize;
    let mut layout = Vec::with_capacity(method.inputs.len());
    for (i, (p, v)) in method.inputs.iter().zip(values).enumerate() {
        let word = if p.ty.is_dynamic() {
            let off = EVMU256::from(head_size + tail_len);
            tail_len += tail_bytes(v)
                .ok_or(AbiError::TypeMismatch { index: i })?
                .len();
            off
        } else {
            EVMU256::from_big_endian(&head_word(&p.ty, v, i)?)
        };
        let (signed, bits) = match p.ty {
            SolType::Int(n) => (true, n),
            SolType::Uint(n) => (false, n),
            _ => (false, 256),
        };
        layout.push((method.vault_name(i), word, signed, bits));
    }
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixed_address;
    use primitive_types::U256;

    const ERC20_ABI: &str = r#"[
        {"type":"function","name":"transfer","stateMutability":"nonpayable",
         "inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}]},
        {"type":"function","name":"name","stateMutability":"view","inputs":[]},
        {"type":"constructor","stateMutability":"nonpayable",
         "inputs":[{"name":"supply","type":"uint256"}]}
    ]"#;

    #[test]
    fn parses_methods_and_constructor() {
        let abi = Abi::parse_str(ERC20_ABI).unwrap();
        assert_eq!(abi.methods.len(), 2);
        let ctor = abi.constructor.as_ref().unwrap();
        assert_eq!(ctor.inputs.len(), 1);
        assert!(abi.method("name").unwrap().is_view());
    }

    #[test]
    fn transfer_selector_matches_known_value() {
        let abi = Abi::parse_str(ERC20_ABI).unwrap();
        let m = abi.method("transfer").unwrap();
        assert_eq!(m.signature(), "transfer(address,uint256)");
        assert_eq!(m.selector(), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn encodes_static_arguments() {
        let abi = Abi::parse_str(ERC20_ABI).unwrap();
        let m = abi.method("transfer").unwrap();
        let to = fixed_address("1111111111111111111111111111111111111111");
        let data = encode_call(
            m,
            &[
                SeedValue::Address(to),
                SeedValue::Uint(U256::from(5u64), 256),
            ],
        )
        .unwrap();
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(&data[16..36], to.as_bytes());
        assert_eq!(data[67], 5);
    }

    #[test]
    fn encodes_dynamic_tail() {
        let inputs = vec![
            Param {
                name: "n".into(),
                ty: SolType::Uint(256),
                type_str: "uint256".into(),
            },
            Param {
                name: "data".into(),
                ty: SolType::Bytes,
                type_str: "bytes".into(),
            },
        ];
        let enc = encode_args(
            &inputs,
            &[
                SeedValue::Uint(U256::from(1u64), 256),
                SeedValue::Bytes(vec![0xaa, 0xbb]),
            ],
        )
        .unwrap();
        // head: value word + offset word; tail: length word + padded data
        assert_eq!(enc.len(), 32 * 4);
        assert_eq!(enc[63], 0x40, "tail offset");
        assert_eq!(enc[95], 2, "tail length");
        assert_eq!(&enc[96..98], &[0xaa, 0xbb]);
    }

    #[test]
    fn vault_names_carry_type_and_argument() {
        let abi = Abi::parse_str(ERC20_ABI).unwrap();
        let m = abi.method("transfer").unwrap();
        assert_eq!(m.vault_name(0), "transfer:address_to");
        assert_eq!(m.vault_name(1), "transfer:uint256_amount");
    }

    #[test]
    fn rejects_malformed_types() {
        assert!(SolType::parse("uint7").is_err());
        assert!(SolType::parse("bytes33").is_err());
        assert!(SolType::parse("uint256[3]").is_ok(), "arrays degrade to bytes");
    }
}
