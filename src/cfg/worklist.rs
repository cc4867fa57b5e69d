//! The shared path queue the symbolic workers drain. Paths are sequences of
//! block start-PCs; a streaming 64-bit hash rejects duplicates, paths longer
//! than the block count plus one are dropped as diverging, and a repeated
//! last PC is treated as a detected loop.
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct PathQueue {
    inner: Mutex<Inner>,
    index: AtomicUsize,
    max_depth: usize,
    /// admit a detected loop entry once instead of never
    allow_loop_revisit: bool,
}

struct Inner {
    paths: Vec<Vec<u64>>,
    hashes: HashSet<u64>,
    revisited: HashSet<u64>,
}

impl PathQueue {
    pub fn new(seeds: Vec<Vec<u64>>, max_depth: usize, allow_loop_revisit: bool) -> Self {
        let queue = Self {
            inner: Mutex::new(Inner {
                paths: Vec::new(),
                hashes: HashSet::new(),
                revisited: HashSet::new(),
            }),
            index: AtomicUsize::new(0),
            max_depth,
            allow_loop_revisit,
        };
        for seed in seeds {
            let _ = queue.append(seed);
        }
        queue
    }

    /// Admit a path unless it is too long, a duplicate, or closes a loop.
    pub fn append(&self, path: Vec<u64>) -> bool {
        if path.len() > self.max_depth {
            return false;
        }
        let mut inner = self.inner.lock().expect("path queue poisoned");
        if let Some(&last) = path.last() {
            if path[..path.len() - 1].contains(&last) {
                if !self.allow_loop_revisit || !inner.revisited.insert(last) {
                    return false;
                }
            }
        }
        let hash = fnv1a64(&path);
        if !inner.hashes.insert(hash) {
            return false;
        }
        inner.paths.push(path);
        true
    }

    /// Hand the next unclaimed path to a worker.
    pub fn get(&self) -> Option<Vec<u64>> {
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().expect("path queue poisoned");
        inner.paths.get(idx).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("path queue poisoned").paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> (usize, usize) {
        let total = self.len();
        (self.index.load(Ordering::SeqCst).min(total), total)
    }
}

fn fnv1a64(path: &[u64]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for pc in path {
        for byte in pc.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_rejected() {
        let q = PathQueue::new(vec![vec![0]], 10, false);
        assert!(!q.append(vec![0]));
        assert!(q.append(vec![0, 4]));
        assert!(!q.append(vec![0, 4]));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn too_long_paths_never_enqueue() {
        let q = PathQueue::new(vec![], 2, false);
        assert!(q.append(vec![1, 2]));
        assert!(!q.append(vec![1, 2, 3]));
    }

    #[test]
    fn loops_are_dropped() {
        let q = PathQueue::new(vec![], 10, false);
        assert!(!q.append(vec![0, 4, 0]));
    }

    #[test]
    fn loop_revisit_knob_admits_one_extra_pass() {
        let q = PathQueue::new(vec![], 10, true);
        assert!(q.append(vec![0, 4, 0]));
        assert!(!q.append(vec![0, 4, 8, 0]));
    }

    #[test]
    fn every_dequeue_is_unique() {
        let q = PathQueue::new(vec![vec![1], vec![2], vec![3]], 10, false);
        let mut got = Vec::new();
        while let Some(p) = q.get() {
            got.push(p[0]);
        }
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);
    }
}
