//! Loading fuzz targets from disk. A contract directory holds
//! `<name>.abi` + `<name>.bin`, optionally `<name>.bin-creation` (preferred
//! when present, it already carries constructor arguments) and
//! `<name>.address-creator`.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use thiserror::Error;
use tracing::{info, warn};

use crate::evm::abi::{Abi, AbiError};
use crate::types::EVMAddress;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("missing input file: {0}")]
    MissingFile(PathBuf),
    #[error("{path} is not hex: {source}")]
    Hex {
        path: PathBuf,
        source: hex::FromHexError,
    },
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("no contract found under {0}")]
    EmptyDir(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Contract {
    pub name: String,
    pub abi: Abi,
    /// deployment bytecode without constructor arguments
    pub static_bin: Vec<u8>,
    /// deployment bytecode with constructor arguments
    pub creation_bin: Option<Vec<u8>>,
    pub creator: Option<EVMAddress>,
}

fn read_hex_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cleaned = text.trim().trim_start_matches("0x");
    hex::decode(cleaned).map_err(|source| LoadError::Hex {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_contract(dir: &Path, name: &str) -> Result<Contract, LoadError> {
    let abi_path = dir.join(format!("{name}.abi"));
    let bin_path = dir.join(format!("{name}.bin"));
    if !abi_path.exists() {
        return Err(LoadError::MissingFile(abi_path));
    }
    if !bin_path.exists() {
        return Err(LoadError::MissingFile(bin_path));
    }

    let abi_text = fs::read_to_string(&abi_path).map_err(|source| LoadError::Io {
        path: abi_path.clone(),
        source,
    })?;
    let abi = Abi::parse_str(&abi_text)?;
    let static_bin = read_hex_file(&bin_path)?;

    let creation_path = dir.join(format!("{name}.bin-creation"));
    let creation_bin = if creation_path.exists() {
        Some(read_hex_file(&creation_path)?)
    } else {
        None
    };

    let creator_path = dir.join(format!("{name}.address-creator"));
    let creator = if creator_path.exists() {
        let raw = read_hex_file(&creator_path)?;
        if raw.len() == 20 {
            Some(EVMAddress::from_slice(&raw))
        } else {
            warn!(path = %creator_path.display(), "creator file is not a 20-byte address");
            None
        }
    } else {
        None
    };

    Ok(Contract {
        name: name.to_string(),
        abi,
        static_bin,
        creation_bin,
        creator,
    })
}

/// Scan a directory for `<name>.abi`/`<name>.bin` pairs. Contracts that
/// fail to load are surfaced in the failure list, not fatal for the rest.
pub fn load_contracts_from_dir(
    dir: &Path,
) -> Result<(Vec<Contract>, Vec<(String, LoadError)>), LoadError> {
    let pattern = dir.join("*.abi");
    let names: Vec<String> = glob::glob(&pattern.to_string_lossy())
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
        .sorted()
        .dedup()
        .collect();
    if names.is_empty() {
        return Err(LoadError::EmptyDir(dir.to_path_buf()));
    }

    let mut contracts = Vec::new();
    let mut failures = Vec::new();
    for name in names {
        match load_contract(dir, &name) {
            Ok(c) => {
                info!(contract = name.as_str(), "loaded contract");
                contracts.push(c);
            }
            Err(e) => {
                warn!(contract = name.as_str(), error = %e, "failed to load contract");
                failures.push((name, e));
            }
        }
    }
    Ok((contracts, failures))
}

/// Keep only the most derived contracts: when one ABI's method set is a
/// strict superset of another's, the subset is a base contract compiled
/// alongside and not worth fuzzing on its own.
pub fn select_targets(contracts: &[Contract]) -> Vec<usize> {
    let sets: Vec<HashSet<String>> = contracts
        .iter()
        .map(|c| c.abi.method_names().into_iter().collect())
        .collect();
    (0..contracts.len())
        .filter(|&i| {
            !sets.iter().enumerate().any(|(j, other)| {
                j != i && other.len() > sets[i].len() && sets[i].is_subset(other)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract_with(names: &[&str]) -> Contract {
        let entries: Vec<String> = names
            .iter()
            .map(|n| {
                format!(
                    r#"{{"type":"function","name":"{n}","stateMutability":"nonpayable","inputs":[]}}"#
                )
            })
            .collect();
        Contract {
            name: names.join("_"),
            abi: Abi::parse_str(&format!("[{}]", entries.join(","))).unwrap(),
            static_bin: vec![0x00],
            creation_bin: None,
            creator: None,
        }
    }

    #[test]
    fn base_contracts_are_dropped() {
        let base = contract_with(&["transfer"]);
        let derived = contract_with(&["transfer", "mint"]);
        let picked = select_targets(&[base, derived]);
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn unrelated_contracts_both_survive() {
        let a = contract_with(&["foo"]);
        let b = contract_with(&["bar"]);
        assert_eq!(select_targets(&[a, b]), vec![0, 1]);
    }

    #[test]
    fn loads_a_contract_pair_from_disk() {
        let dir = std::env::temp_dir().join(format!("bytefuzz-load-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("token.abi"),
            r#"[{"type":"function","name":"ping","stateMutability":"nonpayable","inputs":[]}]"#,
        )
        .unwrap();
        fs::write(dir.join("token.bin"), "600160020100").unwrap();
        let (contracts, failures) = load_contracts_from_dir(&dir).unwrap();
        assert_eq!(contracts.len(), 1);
        assert!(failures.is_empty());
        assert_eq!(contracts[0].static_bin, hex::decode("600160020100").unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_bin_is_a_per_contract_failure() {
        let dir = std::env::temp_dir().join(format!("bytefuzz-miss-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("only.abi"), "[]").unwrap();
        let (contracts, failures) = load_contracts_from_dir(&dir).unwrap();
        assert!(contracts.is_empty());
        assert_eq!(failures.len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
