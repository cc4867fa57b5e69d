//! Input generation. One vault per (method, argument) plus one per magic
//! quantity; solver models flow back in through `add_solution`, execution
//! feedback through `good`/`bad`.
pub mod seed;
pub mod vault;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use tracing::{debug, warn};

use crate::evm::abi::{Abi, Method};
use crate::mutator::seed::SeedValue;
use crate::mutator::vault::Vault;
use crate::types::EVMU256;

pub const MAGIC_CALL_VALUE: &str = "CallValue";

fn magics() -> Vec<&'static str> {
    vec![MAGIC_CALL_VALUE]
}

/// `vault name -> value` pairs the solver must not re-suggest.
pub type Exclusions = Vec<(String, EVMU256)>;

/// Handle to a seed served for one call; seed vectors are append-only so the
/// index stays valid.
#[derive(Debug, Clone)]
pub struct SeedUse {
    pub vault: String,
    pub idx: usize,
}

static MODEL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+) -> (.+)$").expect("model line regex"));

pub struct Mutator {
    vaults: HashMap<String, Vault>,
    /// method name -> ordered per-argument vault names
    method_args: HashMap<String, Vec<String>>,
    exclusions: Exclusions,
    rng: StdRng,
}

impl Mutator {
    pub fn new(abi: &Abi, rng_seed: u64) -> Self {
        let mut vaults = HashMap::new();
        let mut method_args = HashMap::new();

        for magic in magics() {
            vaults.insert(
                magic.to_string(),
                Vault::new(magic, SeedValue::Uint(EVMU256::zero(), 256)),
            );
        }

        let constructor = abi.constructor.clone();
        for method in abi.methods.iter().chain(constructor.as_ref()) {
            let mut names = Vec::with_capacity(method.inputs.len());
            for (i, param) in method.inputs.iter().enumerate() {
                let name = method.vault_name(i);
                vaults.insert(
                    name.clone(),
                    Vault::new(name.clone(), SeedValue::base_for(&param.ty)),
                );
                names.push(name);
            }
            method_args.insert(method.name.clone(), names);
        }

        Self {
            vaults,
            method_args,
            exclusions: Vec::new(),
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    /// Pick one seed per argument of `method`.
    pub fn generate_args(&mut self, method: &Method) -> (Vec<SeedValue>, Vec<SeedUse>) {
        let names = self
            .method_args
            .get(&method.name)
            .cloned()
            .unwrap_or_default();
        let mut values = Vec::with_capacity(names.len());
        let mut uses = Vec::with_capacity(names.len());
        for name in names {
            let vault = self.vaults.get_mut(&name).expect("vault exists per construction");
            let idx = vault.get(&mut self.rng);
            values.push(vault.value(idx).clone());
            uses.push(SeedUse { vault: name, idx });
        }
        (values, uses)
    }

    /// Pick the call value for this call. Non-payable entries always get 0.
    pub fn call_value(&mut self, payable: bool) -> (EVMU256, Option<SeedUse>) {
        if !payable {
            return (EVMU256::zero(), None);
        }
        let vault = self
            .vaults
            .get_mut(MAGIC_CALL_VALUE)
            .expect("magic vault exists");
        let idx = vault.get(&mut self.rng);
        let value = vault.value(idx).to_u256();
        (
            value,
            Some(SeedUse {
                vault: MAGIC_CALL_VALUE.to_string(),
                idx,
            }),
        )
    }

    /// The call completed: reward every seed that shaped it.
    pub fn good(&mut self, uses: &[SeedUse]) {
        for u in uses {
            if let Some(v) = self.vaults.get_mut(&u.vault) {
                v.raise(u.idx);
            }
        }
    }

    /// The call hit an error path: retire every seed that shaped it and
    /// remember its value as a solver exclusion.
    pub fn bad(&mut self, uses: &[SeedUse]) {
        for u in uses {
            if let Some(v) = self.vaults.get_mut(&u.vault) {
                let (name, word) = v.drop(u.idx);
                self.exclusions.push((name, word));
            }
        }
    }

    /// Feed a solver model back into the vaults, line by line. Lines naming
    /// no vault (solver internals, sentinels) are skipped; a model with no
    /// usable line at all is reported.
    pub fn add_solution(&mut self, model: &str) -> usize {
        let mut accepted = 0;
        for line in model.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with(' ') {
                continue;
            }
            let Some(caps) = MODEL_LINE.captures(line) else {
                continue;
            };
            let name = &caps[1];
            let value = caps[2].trim();
            if value.starts_with('{') {
                // function interpretation block, not a point value
                continue;
            }
            match self.vaults.get_mut(name) {
                Some(vault) => {
                    if vault.inherit(value) {
                        accepted += 1;
                        debug!(vault = name, value, "solver solution admitted");
                    } else {
                        warn!(vault = name, value, "unparseable solver value, line ignored");
                    }
                }
                None => {
                    debug!(var = name, "model line names no vault, skipping");
                }
            }
        }
        if accepted == 0 {
            warn!("solver model contained no usable assignment");
        }
        accepted
    }

    pub fn exclusions(&self) -> &Exclusions {
        &self.exclusions
    }

    /// Vault state dump for the stage summary.
    pub fn format_state(&self) -> String {
        let mut names: Vec<&String> = self.vaults.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(&self.vaults[name].format());
        }
        out
    }

    #[cfg(test)]
    pub fn vault(&self, name: &str) -> Option<&Vault> {
        self.vaults.get(name)
    }
}
