//! On-chain mode: pull a deployed contract's creation material from a block
//! explorer and lay it out as a local cache directory the normal loader
//! understands: `.cache/creation/<address>/{<address>.bin-creation,
//! <address>.abi, <address>.address-creator}`.
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use retry::delay::Fixed;
use retry::retry;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const KEYS_FILE: &str = "keys.toml";
pub const CACHE_DIR: &str = ".cache/creation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Eth,
    Sepolia,
    Bsc,
    Polygon,
    Arbitrum,
    Optimism,
    Base,
}

impl Chain {
    pub fn all() -> &'static [Chain] {
        &[
            Chain::Eth,
            Chain::Sepolia,
            Chain::Bsc,
            Chain::Polygon,
            Chain::Arbitrum,
            Chain::Optimism,
            Chain::Base,
        ]
    }

    fn endpoint_base(&self) -> &'static str {
        match self {
            Chain::Eth => "https://api.etherscan.io/api",
            Chain::Sepolia => "https://api-sepolia.etherscan.io/api",
            Chain::Bsc => "https://api.bscscan.com/api",
            Chain::Polygon => "https://api.polygonscan.com/api",
            Chain::Arbitrum => "https://api.arbiscan.io/api",
            Chain::Optimism => "https://api-optimistic.etherscan.io/api",
            Chain::Base => "https://api.basescan.org/api",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Chain::Eth => "eth",
            Chain::Sepolia => "sepolia",
            Chain::Bsc => "bsc",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Base => "base",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Chain {
    type Err = OnchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eth" => Ok(Chain::Eth),
            "sepolia" => Ok(Chain::Sepolia),
            "bsc" => Ok(Chain::Bsc),
            "polygon" => Ok(Chain::Polygon),
            "arbitrum" => Ok(Chain::Arbitrum),
            "optimism" => Ok(Chain::Optimism),
            "base" => Ok(Chain::Base),
            other => Err(OnchainError::UnknownChain(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum OnchainError {
    #[error("unknown chain: {0}")]
    UnknownChain(String),
    #[error("keys.toml is missing or holds no key for {0}; on-chain mode disabled")]
    MissingApiKey(Chain),
    #[error("explorer request failed: {0}")]
    Http(String),
    #[error("explorer answered with an unexpected payload: {0}")]
    BadPayload(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-chain explorer API keys from a `keys.toml` beside the binary. A
/// missing file is tolerated (it only disables on-chain mode).
pub fn api_keys() -> HashMap<Chain, String> {
    api_keys_from(Path::new(KEYS_FILE))
}

pub fn api_keys_from(path: &Path) -> HashMap<Chain, String> {
    let Ok(text) = fs::read_to_string(path) else {
        warn!("failed to open keys.toml, online fuzzing disabled");
        return HashMap::new();
    };
    let Ok(parsed) = text.parse::<toml::Value>() else {
        warn!("failed to parse keys.toml, online fuzzing disabled");
        return HashMap::new();
    };
    let mut keys = HashMap::new();
    if let Some(table) = parsed.as_table() {
        for (name, value) in table {
            let Ok(chain) = Chain::from_str(name) else {
                continue;
            };
            if let Some(key) = value.as_str() {
                keys.insert(chain, key.to_string());
            }
        }
    }
    keys
}

pub struct OnchainClient {
    http: reqwest::blocking::Client,
    keys: HashMap<Chain, String>,
}

impl OnchainClient {
    pub fn new(keys: HashMap<Chain, String>) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            keys,
        }
    }

    fn key_for(&self, chain: Chain) -> Result<&str, OnchainError> {
        self.keys
            .get(&chain)
            .map(|s| s.as_str())
            .ok_or(OnchainError::MissingApiKey(chain))
    }

    fn get_json(&self, url: &str) -> Result<Value, OnchainError> {
        let value = retry(Fixed::from_millis(500).take(3), || {
            self.http
                .get(url)
                .send()
                .and_then(|r| r.json::<Value>())
        })
        .map_err(|e| OnchainError::Http(e.to_string()))?;
        Ok(value)
    }

    fn abi_text(&self, chain: Chain, address: &str) -> Result<String, OnchainError> {
        let url = format!(
            "{}?module=contract&action=getabi&address={address}&apikey={}",
            chain.endpoint_base(),
            self.key_for(chain)?
        );
        let v = self.get_json(&url)?;
        v["result"]
            .as_str()
            .filter(|s| s.starts_with('['))
            .map(|s| s.to_string())
            .ok_or_else(|| OnchainError::BadPayload("no verified abi in response".into()))
    }

    fn creation_info(&self, chain: Chain, address: &str) -> Result<(String, String), OnchainError> {
        let url = format!(
            "{}?module=contract&action=getcontractcreation&contractaddresses={address}&apikey={}",
            chain.endpoint_base(),
            self.key_for(chain)?
        );
        let v = self.get_json(&url)?;
        let entry = v["result"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| OnchainError::BadPayload("no creation record".into()))?;
        let creator = entry["contractCreator"]
            .as_str()
            .ok_or_else(|| OnchainError::BadPayload("no creator address".into()))?;
        let tx = entry["txHash"]
            .as_str()
            .ok_or_else(|| OnchainError::BadPayload("no creation tx".into()))?;
        Ok((creator.to_string(), tx.to_string()))
    }

    fn creation_input(&self, chain: Chain, tx: &str) -> Result<String, OnchainError> {
        let url = format!(
            "{}?module=proxy&action=eth_getTransactionByHash&txhash={tx}&apikey={}",
            chain.endpoint_base(),
            self.key_for(chain)?
        );
        let v = self.get_json(&url)?;
        v["result"]["input"]
            .as_str()
            .map(|s| s.trim_start_matches("0x").to_string())
            .ok_or_else(|| OnchainError::BadPayload("no creation input".into()))
    }

    /// Populate (or reuse) the creation cache for `address` and return the
    /// directory the local loader should scan.
    pub fn prepare_cache(&self, chain: Chain, address: &str) -> Result<PathBuf, OnchainError> {
        let dir = Path::new(CACHE_DIR).join(address);
        let bin_path = dir.join(format!("{address}.bin-creation"));
        if bin_path.exists() {
            info!(address, "creation cache hit");
            return Ok(dir);
        }
        fs::create_dir_all(&dir).map_err(|source| OnchainError::Io {
            path: dir.clone(),
            source,
        })?;

        let abi = self.abi_text(chain, address)?;
        let (creator, tx) = self.creation_info(chain, address)?;
        let input = self.creation_input(chain, &tx)?;

        let write = |path: PathBuf, data: &str| -> Result<(), OnchainError> {
            fs::write(&path, data).map_err(|source| OnchainError::Io { path, source })
        };
        write(dir.join(format!("{address}.abi")), &abi)?;
        write(bin_path, &input)?;
        write(
            dir.join(format!("{address}.address-creator")),
            creator.trim_start_matches("0x"),
        )?;
        info!(address, %chain, "creation cache populated");
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_round_trip() {
        for chain in Chain::all() {
            assert_eq!(Chain::from_str(&chain.to_string()).unwrap(), *chain);
        }
        assert!(Chain::from_str("dogecoin").is_err());
    }

    #[test]
    fn keys_file_parses_per_chain_entries() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("bytefuzz-keys-{}.toml", std::process::id()));
        fs::write(&path, "eth = \"ABC\"\nsepolia = \"DEF\"\nnonsense = \"X\"\n").unwrap();
        let keys = api_keys_from(&path);
        assert_eq!(keys.get(&Chain::Eth).map(String::as_str), Some("ABC"));
        assert_eq!(keys.get(&Chain::Sepolia).map(String::as_str), Some("DEF"));
        assert_eq!(keys.len(), 2);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_keys_file_is_tolerated() {
        let keys = api_keys_from(Path::new("/definitely/not/here/keys.toml"));
        assert!(keys.is_empty());
    }

    #[test]
    fn clients_without_keys_refuse_to_fetch() {
        let client = OnchainClient::new(HashMap::new());
        assert!(matches!(
            client.key_for(Chain::Eth),
            Err(OnchainError::MissingApiKey(Chain::Eth))
        ));
    }
}
