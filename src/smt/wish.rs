//! Conditions the translator cannot express (their dependencies read
//! storage) land on a wish list; the R/W graph then names the entries whose
//! writes could satisfy them, and those become stage-2 prefix candidates.
use crate::cfg::rwgraph::{AccessKind, RwGraph};
use crate::types::EVMU256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wish {
    /// pc of the barrier register
    pub pc: u64,
    /// storage slot it read
    pub slot: EVMU256,
    /// entry whose condition depends on the slot
    pub reader: String,
}

#[derive(Debug, Default)]
pub struct WishSolver {
    wishes: Vec<Wish>,
}

impl WishSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.wishes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wishes.is_empty()
    }

    pub fn push(&mut self, pc: u64, slot: EVMU256, reader: &str) {
        let wish = Wish {
            pc,
            slot,
            reader: reader.to_string(),
        };
        if !self.wishes.contains(&wish) {
            self.wishes.push(wish);
        }
    }

    /// For every wish, the prefixes `[writer, reader]` worth scheduling:
    /// entries that write the wished slot, followed by the wishing entry.
    pub fn candidate_prefixes(&self, graph: &RwGraph) -> Vec<Vec<String>> {
        let mut out: Vec<Vec<String>> = Vec::new();
        for wish in &self.wishes {
            for writer in graph.filter(wish.slot, AccessKind::Write) {
                if writer == wish.reader {
                    continue;
                }
                let prefix = vec![writer, wish.reader.clone()];
                if !out.contains(&prefix) {
                    out.push(prefix);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::rwgraph::SlotAccess;
    use primitive_types::U256;
    use std::collections::HashMap;

    #[test]
    fn wishes_dedup_and_name_writers() {
        let mut list = HashMap::new();
        list.insert(
            "setOwner".to_string(),
            vec![SlotAccess {
                kind: AccessKind::Write,
                key: U256::zero(),
                value: U256::from(42u64),
            }],
        );
        list.insert(
            "onlyOwner".to_string(),
            vec![SlotAccess {
                kind: AccessKind::Read,
                key: U256::zero(),
                value: U256::from(42u64),
            }],
        );
        let graph = RwGraph::new(&list);

        let mut ws = WishSolver::new();
        ws.push(17, U256::zero(), "onlyOwner");
        ws.push(17, U256::zero(), "onlyOwner");
        assert_eq!(ws.len(), 1);

        let prefixes = ws.candidate_prefixes(&graph);
        assert_eq!(
            prefixes,
            vec![vec!["setOwner".to_string(), "onlyOwner".to_string()]]
        );
    }
}
