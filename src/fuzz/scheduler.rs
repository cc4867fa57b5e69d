//! Two-stage call scheduling.
//!
//! Stage 1 enumerates every non-view entry on its own. Stage 2 walks the
//! read/write graph by extending prefixes that previously ran to
//! completion: `lives` holds last round's survivors, `dirties` the work
//! queue of candidates.
use std::collections::VecDeque;

use crate::evm::abi::{Abi, Method};

/// Stage 1: the flat list of externally callable, state-changing entries.
pub struct FuncScheduler {
    methods: Vec<Method>,
}

impl FuncScheduler {
    pub fn new(abi: &Abi) -> Self {
        Self {
            methods: abi
                .methods
                .iter()
                .filter(|m| !m.name.is_empty() && !m.is_view())
                .cloned()
                .collect(),
        }
    }

    pub fn single_funcs(&self) -> &[Method] {
        &self.methods
    }
}

/// Stage 2: prefix extension over the R/W graph node names.
pub struct PrefixScheduler {
    nodes: Vec<String>,
    max_depth: usize,
    depth: usize,
    lives: Vec<Vec<String>>,
    dirties: VecDeque<Vec<String>>,
}

impl PrefixScheduler {
    pub fn new(nodes: Vec<String>, max_depth: usize) -> Self {
        Self {
            nodes,
            max_depth,
            depth: 0,
            lives: Vec::new(),
            dirties: VecDeque::new(),
        }
    }

    /// Queue a prefix ahead of the generated candidates (wish-list input).
    pub fn prefer(&mut self, prefix: Vec<String>) {
        if !prefix.is_empty() && !self.dirties.contains(&prefix) {
            self.dirties.push_front(prefix);
        }
    }

    /// Next prefix to run, refilling from `lives` when the queue drains.
    pub fn next(&mut self) -> Option<Vec<String>> {
        if self.dirties.is_empty() && !self.refill() {
            return None;
        }
        self.dirties.pop_front()
    }

    /// The prefix ran every call to completion: it seeds the next round.
    pub fn good_funcs(&mut self, prefix: Vec<String>) {
        if !self.lives.contains(&prefix) {
            self.lives.push(prefix);
        }
    }

    /// A failing prefix is not extended.
    pub fn bad_funcs(&mut self, _prefix: Vec<String>) {}

    fn refill(&mut self) -> bool {
        if self.depth == 0 {
            self.depth = 1;
            if self.depth > self.max_depth {
                return false;
            }
            self.dirties = self.nodes.iter().map(|n| vec![n.clone()]).collect();
            return !self.dirties.is_empty();
        }
        self.depth += 1;
        if self.depth > self.max_depth {
            return false;
        }
        let lives = std::mem::take(&mut self.lives);
        for prefix in &lives {
            if prefix.len() + 1 != self.depth {
                continue;
            }
            for node in &self.nodes {
                let mut candidate = prefix.clone();
                candidate.push(node.clone());
                if !self.dirties.contains(&candidate) {
                    self.dirties.push_back(candidate);
                }
            }
        }
        !self.dirties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stage_one_drops_views_and_the_constructor() {
        let abi = Abi::parse_str(
            r#"[
                {"type":"function","name":"set","stateMutability":"nonpayable","inputs":[]},
                {"type":"function","name":"get","stateMutability":"view","inputs":[]},
                {"type":"constructor","stateMutability":"nonpayable","inputs":[]}
            ]"#,
        )
        .unwrap();
        let s = FuncScheduler::new(&abi);
        assert_eq!(s.single_funcs().len(), 1);
        assert_eq!(s.single_funcs()[0].name, "set");
    }

    #[test]
    fn depth_one_serves_every_node_once() {
        let mut s = PrefixScheduler::new(names(&["a", "b"]), 1);
        assert_eq!(s.next(), Some(names(&["a"])));
        assert_eq!(s.next(), Some(names(&["b"])));
        assert_eq!(s.next(), None);
    }

    #[test]
    fn only_good_prefixes_are_extended() {
        let mut s = PrefixScheduler::new(names(&["a", "b"]), 2);
        let first = s.next().unwrap();
        s.good_funcs(first);
        let second = s.next().unwrap();
        s.bad_funcs(second);
        // round two: extensions of ["a"] only
        assert_eq!(s.next(), Some(names(&["a", "a"])));
        assert_eq!(s.next(), Some(names(&["a", "b"])));
        assert_eq!(s.next(), None);
    }

    #[test]
    fn exhaustion_without_lives_terminates() {
        let mut s = PrefixScheduler::new(names(&["a"]), 5);
        let p = s.next().unwrap();
        s.bad_funcs(p);
        assert_eq!(s.next(), None);
    }

    #[test]
    fn preferred_prefixes_jump_the_queue() {
        let mut s = PrefixScheduler::new(names(&["a", "b"]), 1);
        s.prefer(names(&["b", "a"]));
        assert_eq!(s.next(), Some(names(&["b", "a"])));
        assert_eq!(s.next(), Some(names(&["a"])));
    }

    #[test]
    fn depth_bound_stops_extension() {
        let mut s = PrefixScheduler::new(names(&["a"]), 2);
        let p1 = s.next().unwrap();
        s.good_funcs(p1);
        let p2 = s.next().unwrap();
        assert_eq!(p2.len(), 2);
        s.good_funcs(p2);
        assert_eq!(s.next(), None, "depth bound reached");
    }
}
