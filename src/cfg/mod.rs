//! Control-flow recovery and coverage bookkeeping.
pub mod block;
pub mod path;
pub mod rwgraph;
pub mod symbolic;
pub mod worklist;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::thread;

use tracing::debug;

pub use crate::cfg::block::{Block, CondBranch, Instruction};
pub use crate::cfg::path::{BranchKind, Path, PathDict};
pub use crate::cfg::rwgraph::{AccessKind, RwGraph, SlotAccess};
use crate::cfg::symbolic::{DestStack, Operation, Outcome, SymbolicInterpreter};
use crate::cfg::worklist::PathQueue;

use crate::asm::InstructionIterator;
use crate::evm::opcode::OpCode;
use crate::evm::register::RegKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCoverage {
    pub sstore_cover: usize,
    pub sstore_total: usize,
    pub sload_cover: usize,
    pub sload_total: usize,
}

pub struct Cfg {
    pub blocks: Vec<Block>,
    pub path_dict: PathDict,

    /// every instruction pc -> owning block
    block_map: HashMap<u64, usize>,
    /// block first pc -> block
    block_start: HashMap<u64, usize>,
    /// pc -> (block, statement)
    stmt_map: HashMap<u64, (usize, usize)>,
    /// last-statement pc -> fall-through block
    direct_successor: HashMap<u64, usize>,
    /// dispatch-table walk seeds (also flags selector blocks)
    dispatch_paths: Vec<Vec<u64>>,

    sload_total: usize,
    sstore_total: usize,

    access_list: HashMap<String, Vec<SlotAccess>>,
}

impl Cfg {
    pub fn new(bytecode: &[u8]) -> Self {
        let mut blocks: Vec<Block> = Vec::new();
        let mut cur = Block::new(0);
        cur.selector = true; // collect statements from the root
        let mut sload_total = 0;
        let mut sstore_total = 0;

        let instrs: Vec<(u64, OpCode, Vec<u8>)> = InstructionIterator::new(bytecode)
            .map(|(pc, op, arg)| (pc, op, arg.to_vec()))
            .collect();

        for (i, (pc, op, arg)) in instrs.iter().enumerate() {
            cur.stmts.push(Instruction::new(*pc, *op, arg.clone()));
            match op {
                &OpCode::SLOAD => sload_total += 1,
                &OpCode::SSTORE => sstore_total += 1,
                _ => {}
            }
            let next_is_dest = instrs
                .get(i + 1)
                .map(|(_, nxt, _)| *nxt == OpCode::JUMPDEST)
                .unwrap_or(false);
            if op.is_terminator() || next_is_dest {
                let idx = cur.index + 1;
                blocks.push(cur);
                cur = Block::new(idx);
            }
        }
        if !cur.stmts.is_empty() {
            blocks.push(cur);
        }

        let mut block_map = HashMap::new();
        let mut block_start = HashMap::new();
        let mut stmt_map = HashMap::new();
        for (bi, b) in blocks.iter().enumerate() {
            block_start.insert(b.first_pc(), bi);
            for (si, s) in b.stmts.iter().enumerate() {
                block_map.insert(s.pc, bi);
                stmt_map.insert(s.pc, (bi, si));
            }
        }

        // fall-through successors: the false side of every conditional jump,
        // plus blocks split by a following JUMPDEST
        let mut direct_successor = HashMap::new();
        for i in 0..blocks.len().saturating_sub(1) {
            if let Some(last) = blocks[i].last() {
                let falls = last.op == OpCode::JUMPI || !last.op.is_terminator();
                if falls {
                    debug!(from = last.pc, to = blocks[i + 1].first_pc(), "fall-through edge");
                    direct_successor.insert(last.pc, i + 1);
                }
            }
        }

        let mut cfg = Self {
            blocks,
            path_dict: PathDict::new(),
            block_map,
            block_start,
            stmt_map,
            direct_successor,
            dispatch_paths: Vec::new(),
            sload_total,
            sstore_total,
            access_list: HashMap::new(),
        };
        cfg.scan_dispatch_table();
        cfg
    }

    /// Walk the leading blocks for the `PUSH2 ++ JUMP/JUMPI` dispatch
    /// pattern, flagging selector blocks and collecting seed paths into each
    /// method body.
    fn scan_dispatch_table(&mut self) {
        let mut prefix: Vec<u64> = Vec::new();
        let mut entries = Vec::new();

        for bi in 0..self.blocks.len() {
            prefix.push(self.blocks[bi].first_pc());
            if prefix.len() == 1 {
                continue;
            }
            let mut dest = None;
            {
                let block = &mut self.blocks[bi];
                for si in 0..block.stmts.len() {
                    let op = block.stmts[si].op;
                    if op == OpCode::PUSH2 {
                        if let Some(next) = block.stmts.get(si + 1) {
                            if next.op == OpCode::JUMPI || next.op == OpCode::JUMP {
                                block.selector = true;
                                dest = Some(block.stmts[si].value().low_u64());
                                break;
                            }
                        }
                    }
                    if op == OpCode::STOP {
                        block.selector = true;
                    }
                }
            }
            let Some(dest) = dest else { break };
            match self.block_start.get(&dest) {
                Some(&target) => {
                    let mut path = prefix.clone();
                    path.push(self.blocks[target].first_pc());
                    entries.push(path);
                }
                None => {
                    debug!(dest, "function selector with an invalid jump destination");
                }
            }
        }
        self.dispatch_paths = entries;
    }

    pub fn block_of(&self, pc: u64) -> Option<&Block> {
        self.block_map.get(&pc).map(|&i| &self.blocks[i])
    }

    /// Pre-discover successors: a worker pool walks candidate paths with the
    /// symbolic interpreter, extending each resolved destination and every
    /// fall-through successor until the queue drains.
    pub fn symbolic_resolve(&mut self, workers: usize) {
        let lut: HashMap<u64, Operation> = self
            .blocks
            .iter()
            .flat_map(|b| b.stmts.iter())
            .map(|s| (s.pc, Operation::new(s.op, s.pc, s.value())))
            .collect();
        let jumpdests: HashSet<u64> = self
            .blocks
            .iter()
            .flat_map(|b| b.stmts.iter())
            .filter(|s| s.op == OpCode::JUMPDEST)
            .map(|s| s.pc)
            .collect();

        // seed with the dispatch paths and with one-block paths for every
        // block that does not begin at a jump destination
        let mut seeds = self.dispatch_paths.clone();
        for b in &self.blocks {
            let starts_at_dest = b
                .stmts
                .first()
                .map(|s| s.op == OpCode::JUMPDEST)
                .unwrap_or(true);
            if !starts_at_dest {
                seeds.push(vec![b.first_pc()]);
            }
        }

        let queue = PathQueue::new(seeds, self.blocks.len() + 1, false);
        let discovered: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
        let edges: Mutex<HashSet<(usize, usize)>> = Mutex::new(HashSet::new());

        let block_start = &self.block_start;
        let direct_successor = &self.direct_successor;
        let blocks = &self.blocks;
        let queue_ref = &queue;
        let discovered_ref = &discovered;
        let edges_ref = &edges;
        let lut_ref = &lut;
        let jumpdests_ref = &jumpdests;

        let workers = workers.max(1);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(move || {
                    let interp = SymbolicInterpreter::new(lut_ref.clone());
                    while let Some(path) = queue_ref.get() {
                        let mut stmts: Vec<u64> = Vec::new();
                        let mut ok = true;
                        for pc in &path {
                            match block_start.get(pc) {
                                Some(&bi) => stmts.extend(blocks[bi].pcs()),
                                None => {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        if !ok || stmts.is_empty() {
                            continue;
                        }
                        let last_block = block_start[&path[path.len() - 1]];
                        let last_pc = *stmts.last().expect("nonempty");

                        let mut dest_stack = DestStack::new(jumpdests_ref.clone());
                        let outcome = match interp.run(&stmts, &mut dest_stack) {
                            Ok(o) => o,
                            Err(_) => continue, // unresolved shape, drop the path
                        };

                        match outcome {
                            Outcome::Halt => continue,
                            Outcome::Dest(dest) => {
                                if let Some(&target) = block_start.get(&dest) {
                                    discovered_ref
                                        .lock()
                                        .expect("discover set poisoned")
                                        .insert(target);
                                    edges_ref
                                        .lock()
                                        .expect("edge set poisoned")
                                        .insert((last_block, target));
                                    let mut np = path.clone();
                                    np.push(dest);
                                    queue_ref.append(np);
                                }
                            }
                            Outcome::Unresolved => {}
                        }

                        // always try the fall-through successor
                        if let Some(&ds) = direct_successor.get(&last_pc) {
                            discovered_ref
                                .lock()
                                .expect("discover set poisoned")
                                .insert(ds);
                            edges_ref
                                .lock()
                                .expect("edge set poisoned")
                                .insert((last_block, ds));
                            let mut np = path.clone();
                            np.push(blocks[ds].first_pc());
                            queue_ref.append(np);
                        }
                    }
                });
            }
        });

        let (done, total) = queue.status();
        debug!(done, total, "symbolic resolution drained the path queue");

        for bi in discovered.into_inner().expect("discover set poisoned") {
            self.blocks[bi].discover = true;
        }
        for (from, to) in edges.into_inner().expect("edge set poisoned") {
            if !self.blocks[from].succs.contains(&to) {
                self.blocks[from].succs.push(to);
            }
        }
    }

    /// Fold a concrete run into the coverage model and extend the entry's
    /// slot access list.
    pub fn update(&mut self, keys: &[RegKey], funcname: &str) {
        for key in keys {
            let pc = key.index.1;
            match key.op {
                OpCode::SLOAD | OpCode::SSTORE => {
                    let kind = if key.op == OpCode::SLOAD {
                        AccessKind::Read
                    } else {
                        AccessKind::Write
                    };
                    self.access_list
                        .entry(funcname.to_string())
                        .or_default()
                        .push(SlotAccess {
                            kind,
                            key: key.slot_key,
                            value: key.slot_value,
                        });
                }
                _ => {}
            }
            let Some(&(bi, si)) = self.stmt_map.get(&pc) else {
                continue;
            };
            self.blocks[bi].alive();
            let stmt = &mut self.blocks[bi].stmts[si];
            stmt.live = true;
            match key.op {
                OpCode::JUMP => stmt.cover_jump(key.dest),
                OpCode::JUMPI => {
                    let branch = if key.cond.is_zero() {
                        CondBranch::False
                    } else {
                        CondBranch::True
                    };
                    stmt.cover_jumpi(key.dest, branch);
                }
                OpCode::SLOAD => stmt.sload_visit += 1,
                OpCode::SSTORE => stmt.sstore_visit += 1,
                _ => {}
            }
        }
    }

    /// Reconstruct the runtime path of a register trace.
    pub fn extract_path(&self, keys: &[RegKey]) -> Path {
        let mut path = Path::default();
        let Some(first) = keys.first() else {
            return path;
        };
        path.start_pc = first.index.1;
        path.start = self.block_map.get(&path.start_pc).copied();

        for (i, key) in keys.iter().enumerate() {
            let pc = key.index.1;
            if i + 1 == keys.len() {
                path.terminate_pc = pc;
                path.terminate = self.block_map.get(&pc).copied();
                break;
            }
            let kind = match key.op {
                OpCode::JUMP => BranchKind::Jump,
                OpCode::JUMPI => {
                    if key.cond.is_zero() {
                        BranchKind::CondFalse
                    } else {
                        BranchKind::CondTrue
                    }
                }
                _ => continue,
            };
            // the run continued at the next register's pc (destination when
            // taken, fall-through otherwise)
            let to = keys[i + 1].index.1;
            path.add_checkpoint(
                pc,
                self.block_map.get(&pc).copied(),
                kind,
                to,
                self.block_map.get(&to).copied(),
            );
        }
        path
    }

    pub fn statement_coverage(&self) -> (usize, usize) {
        let mut covered = 0;
        let mut total = 0;
        for b in &self.blocks {
            for s in &b.stmts {
                if s.live {
                    covered += 1;
                }
                total += 1;
            }
        }
        (covered, total)
    }

    pub fn branch_coverage(&self) -> (usize, usize) {
        let mut covered = 0;
        let mut total = 0;
        for b in &self.blocks {
            for s in &b.stmts {
                let (c, t) = s.branch_coverage();
                covered += c;
                total += t;
            }
        }
        (covered, total)
    }

    pub fn branch_coverage_line(&self, pc: u64) -> (usize, usize) {
        self.stmt_map
            .get(&pc)
            .map(|&(bi, si)| self.blocks[bi].stmts[si].branch_coverage())
            .unwrap_or((0, 0))
    }

    pub fn slot_coverage(&self) -> SlotCoverage {
        let mut cov = SlotCoverage {
            sload_total: self.sload_total,
            sstore_total: self.sstore_total,
            ..Default::default()
        };
        for b in &self.blocks {
            for s in &b.stmts {
                if s.sload_visit > 0 {
                    cov.sload_cover += 1;
                }
                if s.sstore_visit > 0 {
                    cov.sstore_cover += 1;
                }
            }
        }
        cov
    }

    pub fn coverage_string(&self) -> String {
        let (bc, bt) = self.branch_coverage();
        let (sc, st) = self.statement_coverage();
        let slot = self.slot_coverage();
        format!(
            "Branch coverage: {bc}/{bt}  Statement Coverage: {sc}/{st}\n SlotCoverage: R({}/{}) W({}/{})\n",
            slot.sload_cover, slot.sload_total, slot.sstore_cover, slot.sstore_total
        )
    }

    pub fn access_list(&self) -> &HashMap<String, Vec<SlotAccess>> {
        &self.access_list
    }

    pub fn rwgraph(&self) -> RwGraph {
        RwGraph::new(&self.access_list)
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CFG:\n{}", self.coverage_string())?;
        for b in &self.blocks {
            writeln!(f, "{b}")?;
        }
        Ok(())
    }
}
