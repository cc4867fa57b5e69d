//! A vault is a priority-ordered, hash-deduplicated bag of seeds for one
//! argument or one magic quantity.
use std::collections::HashMap;
use std::fmt::Write as _;

use rand::Rng;

use crate::mutator::seed::{Seed, SeedValue};
use crate::types::sha256;

pub type SeedHash = [u8; 32];

#[derive(Debug)]
pub struct Vault {
    /// `<method>:<type>_<arg>` for arguments, a magic label otherwise
    name: String,
    /// prototype: fixes the type and breeds random values
    base: SeedValue,
    seeds: Vec<Seed>,
    seed_map: HashMap<SeedHash, usize>,
    seed_history: HashMap<SeedHash, u64>,
}

impl Vault {
    pub fn new(name: impl Into<String>, base: SeedValue) -> Self {
        Self {
            name: name.into(),
            base,
            seeds: Vec::new(),
            seed_map: HashMap::new(),
            seed_history: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn seed(&self, idx: usize) -> &Seed {
        &self.seeds[idx]
    }

    fn hash_of(&self, value: &SeedValue) -> SeedHash {
        let mut data = self.name.as_bytes().to_vec();
        data.extend(value.hash_bytes());
        sha256(&data)
    }

    /// Highest-priority seed; ties break toward insertion order. An empty
    /// vault breeds one random seed first. Returns a stable index handle;
    /// the seed vector is append-only.
    pub fn get(&mut self, rng: &mut impl Rng) -> usize {
        if self.seeds.is_empty() {
            self.randomize(1, rng);
        }
        let mut best = 0;
        for (i, s) in self.seeds.iter().enumerate() {
            if s.priority > self.seeds[best].priority {
                best = i;
            }
        }
        // everything retired: fall back to a fresh random seed when one can
        // be minted, otherwise hand back the least-bad entry
        if self.seeds[best].is_retired() {
            let before = self.seeds.len();
            self.randomize(1, rng);
            if self.seeds.len() > before {
                best = self.seeds.len() - 1;
            }
        }
        let hash = self.hash_of(&self.seeds[best].value);
        *self.seed_history.entry(hash).or_insert(0) += 1;
        best
    }

    /// Parse a textual value into this vault's type and admit it. A hash
    /// collision raises the existing seed's priority instead of duplicating.
    pub fn inherit(&mut self, val: &str) -> bool {
        match self.base.parse_like(val) {
            Some(v) => {
                self.admit(Seed::new(v));
                true
            }
            None => false,
        }
    }

    pub fn randomize(&mut self, n: usize, rng: &mut impl Rng) {
        for _ in 0..n {
            let v = self.base.random_like(rng);
            self.admit(Seed::new(v));
        }
    }

    fn admit(&mut self, seed: Seed) {
        let hash = self.hash_of(&seed.value);
        match self.seed_map.get(&hash) {
            Some(&idx) => {
                self.seeds[idx].priority += 1;
            }
            None => {
                self.seeds.push(seed);
                self.seed_map.insert(hash, self.seeds.len() - 1);
                self.seed_history.insert(hash, 0);
            }
        }
    }

    pub fn raise(&mut self, idx: usize) {
        if idx < self.seeds.len() {
            self.seeds[idx].priority += 1;
        }
    }

    /// Retire a seed. Returns the vault name and the word it packed to, the
    /// shape the solver exclusion list wants.
    pub fn drop(&mut self, idx: usize) -> (String, crate::types::EVMU256) {
        let word = if idx < self.seeds.len() {
            self.seeds[idx].drop_priority();
            self.seeds[idx].value.to_u256()
        } else {
            crate::types::EVMU256::zero()
        };
        (self.name.clone(), word)
    }

    pub fn value(&self, idx: usize) -> &SeedValue {
        &self.seeds[idx].value
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        for s in &self.seeds {
            let _ = writeln!(out, "[{}] {} -> {}", s.priority, self.name, s.value);
        }
        out
    }

    #[cfg(test)]
    pub fn priorities(&self) -> Vec<i64> {
        self.seeds.iter().map(|s| s.priority).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::seed::RETIRED_PRIORITY;
    use primitive_types::U256;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn u256_vault() -> Vault {
        Vault::new("probe:uint256_x", SeedValue::Uint(U256::zero(), 256))
    }

    #[test]
    fn hashes_are_pairwise_distinct() {
        let mut v = u256_vault();
        let mut rng = StdRng::seed_from_u64(7);
        v.randomize(50, &mut rng);
        v.inherit("1");
        v.inherit("2");
        let mut hashes: Vec<_> = v.seeds.iter().map(|s| v.hash_of(&s.value)).collect();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), v.len());
    }

    #[test]
    fn duplicate_solution_raises_priority_without_appending() {
        let mut v = u256_vault();
        v.inherit("42");
        let before = v.len();
        v.inherit("42");
        assert_eq!(v.len(), before);
        assert_eq!(v.seed(0).priority, 1);
    }

    #[test]
    fn dropped_seed_is_never_served_while_alternatives_exist() {
        let mut v = u256_vault();
        let mut rng = StdRng::seed_from_u64(7);
        v.inherit("1");
        v.inherit("2");
        let (_, _) = v.drop(0);
        for _ in 0..10 {
            let got = v.get(&mut rng);
            assert_ne!(got, 0, "retired seed must not be served");
        }
    }

    #[test]
    fn get_prefers_priority_then_insertion_order() {
        let mut v = u256_vault();
        let mut rng = StdRng::seed_from_u64(7);
        v.inherit("1");
        v.inherit("2");
        v.inherit("3");
        assert_eq!(v.get(&mut rng), 0);
        v.raise(2);
        assert_eq!(v.get(&mut rng), 2);
    }

    #[test]
    fn drop_is_monotone() {
        let mut v = u256_vault();
        v.inherit("9");
        v.drop(0);
        assert_eq!(v.seed(0).priority, RETIRED_PRIORITY);
        v.drop(0);
        assert!(v.seed(0).priority < RETIRED_PRIORITY);
    }
}
