//! Runtime paths and the prefix dictionary that detects new ones.
use std::collections::HashSet;
use std::fmt;

use crate::types::sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Jump = 0,
    CondTrue = 1,
    CondFalse = 2,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub pc_from: u64,
    pub from: Option<usize>,
    pub kind: BranchKind,
    pub pc_to: u64,
    pub to: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Path {
    pub start_pc: u64,
    pub start: Option<usize>,
    pub checkpoints: Vec<Checkpoint>,
    pub terminate_pc: u64,
    pub terminate: Option<usize>,
}

impl Path {
    pub fn add_checkpoint(
        &mut self,
        pc_from: u64,
        from: Option<usize>,
        kind: BranchKind,
        pc_to: u64,
        to: Option<usize>,
    ) {
        self.checkpoints.push(Checkpoint {
            pc_from,
            from,
            kind,
            pc_to,
            to,
        });
    }

    /// Split the path into its prefix subsequences: the bare start, then one
    /// prefix per checkpoint. Each prefix hashes to one dictionary key.
    pub fn distract(&self) -> Vec<Vec<u64>> {
        let mut out = Vec::with_capacity(self.checkpoints.len() + 1);
        let mut cur = vec![self.start_pc];
        out.push(cur.clone());
        for cp in &self.checkpoints {
            cur.push(cp.kind as u64);
            cur.push(cp.pc_to);
            out.push(cur.clone());
        }
        out
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "> 0x{:x}", self.start_pc)?;
        for (i, cp) in self.checkpoints.iter().enumerate() {
            let arrow = match cp.kind {
                BranchKind::Jump => ", ",
                BranchKind::CondFalse => " -F> ",
                BranchKind::CondTrue => " -T> ",
            };
            write!(f, "{arrow}0x{:x}", cp.pc_to)?;
            if i == self.checkpoints.len() - 1 {
                write!(f, " |")?;
            }
        }
        Ok(())
    }
}

/// Dictionary of every path prefix ever observed, keyed by a 256-bit hash.
#[derive(Debug, Default)]
pub struct PathDict {
    dict: HashSet<[u8; 32]>,
}

impl PathDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Insert every prefix of `path`; `true` when at least one was new.
    pub fn is_new_path_discovered(&mut self, path: &Path) -> bool {
        let mut discovered = false;
        for prefix in path.distract() {
            if self.dict.insert(hash_prefix(&prefix)) {
                discovered = true;
            }
        }
        discovered
    }
}

fn hash_prefix(prefix: &[u64]) -> [u8; 32] {
    let mut bytes = Vec::with_capacity(prefix.len() * 8);
    for v in prefix {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    sha256(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(hops: &[(u64, BranchKind, u64)]) -> Path {
        let mut p = Path {
            start_pc: hops.first().map(|h| h.0).unwrap_or(0),
            ..Default::default()
        };
        for &(from, kind, to) in hops {
            p.add_checkpoint(from, None, kind, to, None);
        }
        p.terminate_pc = hops.last().map(|h| h.2).unwrap_or(p.start_pc);
        p
    }

    #[test]
    fn distract_yields_one_prefix_per_hop_plus_root() {
        let p = path(&[
            (0x10, BranchKind::CondTrue, 0x20),
            (0x20, BranchKind::CondFalse, 0x30),
            (0x30, BranchKind::CondTrue, 0x40),
        ]);
        assert_eq!(p.distract().len(), 4);
    }

    #[test]
    fn replay_inserts_nothing_and_divergence_inserts_one() {
        let mut dict = PathDict::new();
        let p = path(&[
            (0x10, BranchKind::CondTrue, 0x20),
            (0x20, BranchKind::CondFalse, 0x30),
            (0x30, BranchKind::CondTrue, 0x40),
        ]);
        assert!(dict.is_new_path_discovered(&p));
        let before = dict.len();
        assert!(!dict.is_new_path_discovered(&p));
        assert_eq!(dict.len(), before);

        // same journey, different last stop
        let q = path(&[
            (0x10, BranchKind::CondTrue, 0x20),
            (0x20, BranchKind::CondFalse, 0x30),
            (0x30, BranchKind::CondTrue, 0x50),
        ]);
        assert!(dict.is_new_path_discovered(&q));
        assert_eq!(dict.len(), before + 1);
    }

    #[test]
    fn branch_kind_distinguishes_prefixes() {
        let mut dict = PathDict::new();
        let t = path(&[(0x10, BranchKind::CondTrue, 0x20)]);
        let f = path(&[(0x10, BranchKind::CondFalse, 0x20)]);
        assert!(dict.is_new_path_discovered(&t));
        assert!(dict.is_new_path_discovered(&f));
    }

    #[test]
    fn single_block_path_still_registers() {
        let mut dict = PathDict::new();
        let p = Path {
            start_pc: 0,
            terminate_pc: 0,
            ..Default::default()
        };
        assert!(dict.is_new_path_discovered(&p));
        assert!(!dict.is_new_path_discovered(&p));
    }

    #[test]
    fn rendering_matches_the_arrow_notation() {
        let p = path(&[
            (0x10, BranchKind::CondTrue, 0x20),
            (0x20, BranchKind::CondFalse, 0x30),
        ]);
        assert_eq!(format!("{p}"), "> 0x10 -T> 0x20 -F> 0x30 |");
    }
}
