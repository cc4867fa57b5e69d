//! The read/write dependency graph over public entries. A weighted edge
//! `A -> B` says values written by `A` match values `B` later reads.
use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EVMU256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotAccess {
    pub kind: AccessKind,
    pub key: EVMU256,
    pub value: EVMU256,
}

impl fmt::Display for SlotAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            AccessKind::Read => "R",
            AccessKind::Write => "W",
        };
        write!(f, "[{kind}] {:#x} -> {:#x}", self.key, self.value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RwGraphError {
    #[error("read/write graph has no entry node")]
    NoEntryNodes,
}

/// (key, value) set with same-key-same-value absorption.
#[derive(Debug, Default, Clone)]
struct Kvs(Vec<(EVMU256, EVMU256)>);

impl Kvs {
    fn absorb(&mut self, key: EVMU256, value: EVMU256) {
        if !self.exist(key, value) {
            self.0.push((key, value));
        }
    }

    fn exist(&self, key: EVMU256, value: EVMU256) -> bool {
        self.0.iter().any(|(k, v)| *k == key && *v == value)
    }

    fn has_key(&self, key: EVMU256) -> bool {
        self.0.iter().any(|(k, _)| *k == key)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    reads: Kvs,
    writes: Kvs,
    /// (target node, weight): entries that should run after this one
    afters: Vec<(usize, u64)>,
}

#[derive(Debug, Default)]
pub struct RwGraph {
    nodes: Vec<Node>,
}

impl RwGraph {
    /// Build nodes from the per-entry access lists, then wire one weighted
    /// edge per matching write/read pair.
    pub fn new(access_list: &HashMap<String, Vec<SlotAccess>>) -> Self {
        let mut names: Vec<&String> = access_list.keys().collect();
        names.sort();

        let mut nodes: Vec<Node> = names
            .iter()
            .map(|name| {
                let mut reads = Kvs::default();
                let mut writes = Kvs::default();
                for access in &access_list[*name] {
                    match access.kind {
                        AccessKind::Read => reads.absorb(access.key, access.value),
                        AccessKind::Write => writes.absorb(access.key, access.value),
                    }
                }
                Node {
                    name: (*name).clone(),
                    reads,
                    writes,
                    afters: Vec::new(),
                }
            })
            .collect();

        for a in 0..nodes.len() {
            for kv in nodes[a].writes.0.clone() {
                for b in 0..nodes.len() {
                    if nodes[b].reads.exist(kv.0, kv.1) {
                        match nodes[a].afters.iter_mut().find(|(t, _)| *t == b) {
                            Some((_, cnt)) => *cnt += 1,
                            None => nodes[a].afters.push((b, 1)),
                        }
                    }
                }
            }
        }

        Self { nodes }
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn edge_weight(&self, from: &str, to: &str) -> u64 {
        let Some(a) = self.nodes.iter().position(|n| n.name == from) else {
            return 0;
        };
        let Some(b) = self.nodes.iter().position(|n| n.name == to) else {
            return 0;
        };
        self.nodes[a]
            .afters
            .iter()
            .find(|(t, _)| *t == b)
            .map(|(_, w)| *w)
            .unwrap_or(0)
    }

    /// Entries with no incoming edge. Empty is fatal for stage 2.
    pub fn entries(&self) -> Result<Vec<String>, RwGraphError> {
        let mut incoming = vec![false; self.nodes.len()];
        for n in &self.nodes {
            for (t, _) in &n.afters {
                incoming[*t] = true;
            }
        }
        let out: Vec<String> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !incoming[*i])
            .map(|(_, n)| n.name.clone())
            .collect();
        if out.is_empty() {
            return Err(RwGraphError::NoEntryNodes);
        }
        Ok(out)
    }

    /// Every entry whose set touches `key` with the given kind.
    pub fn filter(&self, key: EVMU256, kind: AccessKind) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| match kind {
                AccessKind::Read => n.reads.has_key(key),
                AccessKind::Write => n.writes.has_key(key),
            })
            .map(|n| n.name.clone())
            .collect()
    }

    /// Random walk: start at a random entry node, then step `depth - 1`
    /// times. Each step picks an outgoing neighbour with probability
    /// proportional to edge weight; a dead end falls back to any node
    /// weighted by write-set size.
    pub fn visit(&self, depth: usize, rng: &mut impl Rng) -> Result<Vec<String>, RwGraphError> {
        let entries = self.entries()?;
        let start = &entries[rng.gen_range(0..entries.len())];
        let mut cur = self
            .nodes
            .iter()
            .position(|n| &n.name == start)
            .unwrap_or(0);
        let mut out = vec![self.nodes[cur].name.clone()];

        for _ in 1..depth {
            cur = match self.pick_after(cur, rng) {
                Some(next) => next,
                None => self.pick_by_write_weight(rng),
            };
            out.push(self.nodes[cur].name.clone());
        }
        Ok(out)
    }

    fn pick_after(&self, node: usize, rng: &mut impl Rng) -> Option<usize> {
        let afters = &self.nodes[node].afters;
        let total: u64 = afters.iter().map(|(_, w)| *w).sum();
        if total == 0 {
            return None;
        }
        let mut roll = rng.gen_range(0..total);
        for (target, weight) in afters {
            if roll < *weight {
                return Some(*target);
            }
            roll -= weight;
        }
        None
    }

    fn pick_by_write_weight(&self, rng: &mut impl Rng) -> usize {
        let total: usize = self.nodes.iter().map(|n| n.writes.len()).sum();
        if total == 0 {
            return rng.gen_range(0..self.nodes.len());
        }
        let mut roll = rng.gen_range(0..total);
        for (i, n) in self.nodes.iter().enumerate() {
            if roll < n.writes.len() {
                return i;
            }
            roll -= n.writes.len();
        }
        self.nodes.len() - 1
    }
}

impl fmt::Display for RwGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in &self.nodes {
            write!(f, "Node: {} [", n.name)?;
            for (t, w) in &n.afters {
                write!(f, "{}({w}) ", self.nodes[*t].name)?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn access(kind: AccessKind, key: u64, value: u64) -> SlotAccess {
        SlotAccess {
            kind,
            key: U256::from(key),
            value: U256::from(value),
        }
    }

    fn owner_graph() -> RwGraph {
        let mut list = HashMap::new();
        list.insert(
            "setOwner".to_string(),
            vec![access(AccessKind::Write, 0, 42)],
        );
        list.insert(
            "onlyOwner".to_string(),
            vec![access(AccessKind::Read, 0, 42)],
        );
        RwGraph::new(&list)
    }

    #[test]
    fn write_read_match_creates_one_weighted_edge() {
        let g = owner_graph();
        assert_eq!(g.edge_weight("setOwner", "onlyOwner"), 1);
        assert_eq!(g.edge_weight("onlyOwner", "setOwner"), 0);
    }

    #[test]
    fn same_key_same_value_is_absorbed() {
        let mut list = HashMap::new();
        list.insert(
            "w".to_string(),
            vec![
                access(AccessKind::Write, 0, 42),
                access(AccessKind::Write, 0, 42),
                access(AccessKind::Write, 0, 43),
            ],
        );
        list.insert("r".to_string(), vec![access(AccessKind::Read, 0, 42)]);
        let g = RwGraph::new(&list);
        // two distinct writes, only one matches the read
        assert_eq!(g.edge_weight("w", "r"), 1);
    }

    #[test]
    fn entries_are_nodes_without_incoming_edges() {
        let g = owner_graph();
        assert_eq!(g.entries().unwrap(), vec!["setOwner".to_string()]);
    }

    #[test]
    fn empty_graph_has_no_entries() {
        let g = RwGraph::new(&HashMap::new());
        assert_eq!(g.entries(), Err(RwGraphError::NoEntryNodes));
    }

    #[test]
    fn visit_walks_edges_from_an_entry() {
        let g = owner_graph();
        let mut rng = StdRng::seed_from_u64(3);
        let walk = g.visit(2, &mut rng).unwrap();
        assert_eq!(walk[0], "setOwner");
        assert_eq!(walk[1], "onlyOwner");
    }

    #[test]
    fn filter_finds_writers_of_a_slot() {
        let g = owner_graph();
        assert_eq!(
            g.filter(U256::zero(), AccessKind::Write),
            vec!["setOwner".to_string()]
        );
    }
}
