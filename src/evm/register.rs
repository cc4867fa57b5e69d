//! The per-call register trace.
//!
//! Every opcode the interpreter executes appends one register to an
//! append-only arena; handles into the arena are plain indices, so the
//! rebuilt expression graph is acyclic by construction (parents always point
//! at earlier entries). After the call the trace is frozen and `rebuild`
//! wires each register's parents by replaying the stack discipline the
//! interpreter used.
use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::warn;

use crate::evm::opcode::OpCode;
use crate::types::EVMU256;

/// (call depth, pc, revisit count), unique within one execution.
pub type RegIndex = (u64, u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegId(pub usize);

/// Slot a parent occupies, bottom of the consumed operands first.
/// `L` is the deepest operand, `M` the next, then `R0..R4`.
pub const PARENT_SLOTS: usize = 7;

#[derive(Debug, Clone)]
pub struct ArgBind {
    /// fully qualified vault name `<method>:<type>_<arg>`
    pub vault: String,
    pub arg_index: usize,
    pub signed: bool,
    pub bits: usize,
}

#[derive(Debug, Clone)]
pub struct Register {
    pub index: RegIndex,
    pub op: OpCode,
    pub param_size: usize,
    pub pushback_size: usize,
    /// value produced (the pushed word; immediates for the push family)
    pub value: EVMU256,
    parents: [Option<RegId>; PARENT_SLOTS],
    cp: Option<RegId>,

    // opcode-specific ancillary fields
    pub dest: u64,
    pub cond: EVMU256,
    pub mem_offset: u64,
    pub slot_key: EVMU256,
    pub slot_value: EVMU256,

    pub arg_bind: Option<ArgBind>,
}

impl Register {
    fn new(index: RegIndex, op: OpCode) -> Self {
        let (param_size, pushback_size) = op.reg_arity();
        Self {
            index,
            op,
            param_size,
            pushback_size,
            value: EVMU256::zero(),
            parents: [None; PARENT_SLOTS],
            cp: None,
            dest: 0,
            cond: EVMU256::zero(),
            mem_offset: 0,
            slot_key: EVMU256::zero(),
            slot_value: EVMU256::zero(),
            arg_bind: None,
        }
    }

    pub fn pc(&self) -> u64 {
        self.index.1
    }

    pub fn depth(&self) -> u64 {
        self.index.0
    }

    pub fn parents(&self) -> impl Iterator<Item = RegId> + '_ {
        self.parents.iter().flatten().copied()
    }

    pub fn parent(&self, slot: usize) -> Option<RegId> {
        self.parents.get(slot).copied().flatten()
    }

    pub fn cp(&self) -> Option<RegId> {
        self.cp
    }

    fn name(&self) -> String {
        format!("[{},{},{}]", self.index.0, self.index.1, self.index.2)
    }
}

/// Key handed to the CFG after a run: the indexing triple plus the fields
/// coverage bookkeeping needs.
#[derive(Debug, Clone)]
pub struct RegKey {
    pub id: RegId,
    pub index: RegIndex,
    pub op: OpCode,
    pub dest: u64,
    pub cond: EVMU256,
    pub slot_key: EVMU256,
    pub slot_value: EVMU256,
}

#[derive(Debug, Default)]
pub struct RegPool {
    regs: Vec<Register>,
    revisits: HashMap<(u64, u64), u64>,
    rebuilt: bool,
}

impl RegPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn get(&self, id: RegId) -> &Register {
        &self.regs[id.0]
    }

    /// Append a register for an opcode about to execute. The triple is made
    /// unique by bumping the (depth, pc) revisit counter.
    pub fn append(&mut self, depth: u64, pc: u64, op: OpCode) -> RegId {
        let revisit = {
            let c = self.revisits.entry((depth, pc)).or_insert(0);
            let cur = *c;
            *c += 1;
            cur
        };
        self.regs.push(Register::new((depth, pc, revisit), op));
        RegId(self.regs.len() - 1)
    }

    pub fn set_value(&mut self, id: RegId, value: EVMU256) {
        self.regs[id.0].value = value;
    }

    pub fn set_jump(&mut self, id: RegId, dest: u64) {
        self.regs[id.0].dest = dest;
    }

    pub fn set_branch(&mut self, id: RegId, dest: u64, cond: EVMU256) {
        self.regs[id.0].dest = dest;
        self.regs[id.0].cond = cond;
    }

    pub fn set_slot(&mut self, id: RegId, key: EVMU256, value: EVMU256) {
        self.regs[id.0].slot_key = key;
        self.regs[id.0].slot_value = value;
    }

    pub fn set_mem_offset(&mut self, id: RegId, offset: u64) {
        self.regs[id.0].mem_offset = offset;
    }

    pub fn keys(&self) -> Vec<RegKey> {
        self.regs
            .iter()
            .enumerate()
            .map(|(i, r)| RegKey {
                id: RegId(i),
                index: r.index,
                op: r.op,
                dest: r.dest,
                cond: r.cond,
                slot_key: r.slot_key,
                slot_value: r.slot_value,
            })
            .collect()
    }

    /// Wire parents by replaying the trace once with the same stack
    /// discipline the interpreter used. Parents are set exactly once; after
    /// this the pool is read-only.
    pub fn rebuild(&mut self) {
        if self.rebuilt {
            return;
        }
        self.rebuilt = true;

        let mut stack: Vec<RegId> = Vec::new();
        for i in 0..self.regs.len() {
            let op = self.regs[i].op;
            let id = RegId(i);

            if op.is_push() {
                stack.push(id);
                continue;
            }
            if op.is_dup() {
                let n = op.dup_n();
                if stack.len() < n {
                    warn!(pc = self.regs[i].pc(), "stack underflow rebuilding DUP");
                } else {
                    self.regs[i].cp = Some(stack[stack.len() - n]);
                }
                stack.push(id);
                continue;
            }
            if op.is_swap() {
                let n = op.swap_n();
                if stack.len() < n + 1 {
                    warn!(pc = self.regs[i].pc(), "stack underflow rebuilding SWAP");
                } else {
                    let top = stack.len() - 1;
                    stack.swap(top, top - n);
                    self.regs[i].cp = Some(stack[top]);
                }
                continue;
            }

            let (params, pushback) = (self.regs[i].param_size, self.regs[i].pushback_size);
            let take = params.min(stack.len());
            if take < params {
                warn!(
                    pc = self.regs[i].pc(),
                    op = %op,
                    missing = params - take,
                    "stack underflow during rebuild, parents left nil"
                );
            }
            let popped = stack.split_off(stack.len() - take);
            // popped is bottom-to-top: slot 0 (`L`) is the deepest operand
            for (slot, pid) in popped.into_iter().enumerate() {
                self.regs[i].parents[slot] = Some(pid);
            }

            // control transfers consume without producing
            if op == OpCode::JUMP || op == OpCode::JUMPI {
                continue;
            }
            for _ in 0..pushback {
                stack.push(id);
            }
        }
    }

    /// Bind calldata loads back to the named arguments that produced them.
    /// `layout[i]` describes argument `i`: vault name, expected head word,
    /// signedness and width. A value mismatch is logged and skipped.
    pub fn bind_args(&mut self, layout: &[(String, EVMU256, bool, usize)]) {
        for reg in &mut self.regs {
            if reg.op != OpCode::CALLDATALOAD {
                continue;
            }
            let off = reg.mem_offset;
            if off < 4 || (off - 4) % 32 != 0 {
                continue;
            }
            let idx = ((off - 4) / 32) as usize;
            let Some((vault, expected, signed, bits)) = layout.get(idx) else {
                continue;
            };
            if reg.value != *expected {
                warn!(
                    vault = vault.as_str(),
                    got = %reg.value,
                    want = %expected,
                    "calldata word does not match packed argument, not binding"
                );
                continue;
            }
            reg.arg_bind = Some(ArgBind {
                vault: vault.clone(),
                arg_index: idx,
                signed: *signed,
                bits: *bits,
            });
        }
    }

    /// Every register the node transitively depends on through parents
    /// (following duplicate/swap sources).
    pub fn relies(&self, id: RegId) -> Vec<RegId> {
        let mut seen = vec![false; self.regs.len()];
        let mut out = Vec::new();
        let mut work = vec![id];
        while let Some(cur) = work.pop() {
            let reg = &self.regs[cur.0];
            let deps = reg.parents().chain(reg.cp);
            for dep in deps {
                if !seen[dep.0] {
                    seen[dep.0] = true;
                    out.push(dep);
                    work.push(dep);
                }
            }
        }
        out
    }

    /// register bound to a named input argument
    pub fn is_bind(&self, id: RegId) -> bool {
        self.regs[id.0].arg_bind.is_some()
    }

    /// register holding a per-call environmental quantity
    pub fn is_magic(&self, id: RegId) -> bool {
        matches!(
            self.regs[id.0].op,
            OpCode::CALLVALUE | OpCode::CALLER | OpCode::ORIGIN | OpCode::TIMESTAMP | OpCode::NUMBER
        )
    }

    /// register reading state with no symbolic expression behind it
    pub fn is_barrier(&self, id: RegId) -> bool {
        let r = &self.regs[id.0];
        match r.op {
            OpCode::SLOAD
            | OpCode::MLOAD
            | OpCode::KECCAK256
            | OpCode::BALANCE
            | OpCode::SELFBALANCE
            | OpCode::BLOCKHASH
            | OpCode::EXTCODESIZE
            | OpCode::EXTCODEHASH
            | OpCode::RETURNDATASIZE
            | OpCode::CREATE
            | OpCode::CREATE2 => true,
            op if op.is_call() => true,
            OpCode::CALLDATALOAD => r.arg_bind.is_none(),
            _ => false,
        }
    }

    /// Conditional jumps of the trace paired with their condition register.
    pub fn jumpi_conds(&self) -> Vec<(RegId, RegId)> {
        self.regs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.op == OpCode::JUMPI)
            .filter_map(|(i, r)| r.parent(0).map(|cond| (RegId(i), cond)))
            .collect()
    }

    /// Tree rendering of a register and its transitive parents. Control,
    /// logging, push, dup and swap nodes are not expanded further.
    pub fn expand(&self, id: RegId, depth: usize) -> String {
        let mut out = String::new();
        self.expand_into(id, depth, &mut out);
        out
    }

    fn expand_into(&self, id: RegId, depth: usize, out: &mut String) {
        if depth > 1024 {
            warn!("register expansion overflow, depth > 1024");
            return;
        }
        // duplicates render their source
        let mut target = id;
        while let Some(src) = self.regs[target.0].cp {
            target = src;
        }
        let reg = &self.regs[target.0];

        if depth == 0 {
            let _ = writeln!(out, "{} {}", reg.name(), reg.op);
        } else {
            let indents = ".".repeat(6 * depth);
            let _ = writeln!(
                out,
                "{}   └── {} {} <- {:#x}",
                indents,
                reg.name(),
                reg.op,
                reg.value
            );
        }

        let skip = matches!(reg.op, OpCode::STOP | OpCode::POP | OpCode::JUMPDEST)
            || reg.op.is_dup()
            || reg.op.is_log()
            || reg.op.is_swap()
            || reg.op.is_push();
        if skip && depth > 0 {
            return;
        }
        for pid in reg.parents() {
            self.expand_into(pid, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    fn pool_of(ops: &[(u64, OpCode, u64)]) -> RegPool {
        let mut pool = RegPool::new();
        for &(pc, op, val) in ops {
            let id = pool.append(1, pc, op);
            pool.set_value(id, U256::from(val));
        }
        pool
    }

    #[test]
    fn revisit_counter_makes_triples_unique() {
        let mut pool = RegPool::new();
        let a = pool.append(1, 2, OpCode::DUP2);
        let b = pool.append(1, 2, OpCode::DUP2);
        assert_eq!(pool.get(a).index, (1, 2, 0));
        assert_eq!(pool.get(b).index, (1, 2, 1));
    }

    #[test]
    fn rebuild_wires_binary_parents_bottom_to_top() {
        // PUSH1 1, PUSH1 2, ADD
        let mut pool = pool_of(&[
            (0, OpCode::PUSH1, 1),
            (2, OpCode::PUSH1, 2),
            (4, OpCode::ADD, 3),
        ]);
        pool.rebuild();
        let add = pool.get(RegId(2));
        assert_eq!(add.parent(0), Some(RegId(0)));
        assert_eq!(add.parent(1), Some(RegId(1)));
        assert_eq!(add.parents().count(), add.param_size);
    }

    #[test]
    fn rebuild_dup_records_cp_and_no_parents() {
        let mut pool = pool_of(&[
            (0, OpCode::PUSH1, 1),
            (1, OpCode::PUSH2, 2),
            (2, OpCode::DUP2, 1),
            (2, OpCode::DUP2, 2),
        ]);
        pool.rebuild();
        assert_eq!(pool.get(RegId(2)).cp(), Some(RegId(0)));
        // after the first dup the 2nd-from-top is the PUSH2
        assert_eq!(pool.get(RegId(3)).cp(), Some(RegId(1)));
        assert_eq!(pool.get(RegId(2)).parents().count(), 0);
    }

    #[test]
    fn rebuild_swap_rotates_without_consuming() {
        let mut pool = pool_of(&[
            (0, OpCode::PUSH1, 1),
            (1, OpCode::PUSH2, 2),
            (2, OpCode::SWAP1, 0),
            (3, OpCode::POP, 0),
        ]);
        pool.rebuild();
        // swap left PUSH1 on top; POP consumed it
        assert_eq!(pool.get(RegId(3)).parent(0), Some(RegId(0)));
        assert_eq!(pool.get(RegId(2)).cp(), Some(RegId(0)));
    }

    #[test]
    fn jumpi_parents_are_cond_then_dest() {
        // JUMPI pops dest (top) then cond, so the stack bottom-to-top is
        // [cond, dest]: push the condition first
        let mut pool = pool_of(&[
            (0, OpCode::PUSH1, 1), // cond
            (2, OpCode::PUSH1, 8), // dest
            (4, OpCode::JUMPI, 0),
        ]);
        pool.rebuild();
        let ji = pool.get(RegId(2));
        assert_eq!(ji.parent(0), Some(RegId(0)), "L is the condition");
        assert_eq!(ji.parent(1), Some(RegId(1)), "M is the destination");
    }

    #[test]
    fn push_only_registers_have_no_params() {
        let pool = pool_of(&[(0, OpCode::PUSH32, 7)]);
        assert_eq!(pool.get(RegId(0)).param_size, 0);
    }

    #[test]
    fn underflow_leaves_parents_nil() {
        let mut pool = pool_of(&[(0, OpCode::ADD, 0)]);
        pool.rebuild();
        assert_eq!(pool.get(RegId(0)).parents().count(), 0);
    }

    #[test]
    fn relies_walks_transitive_parents() {
        let mut pool = pool_of(&[
            (0, OpCode::PUSH1, 1),
            (2, OpCode::PUSH1, 2),
            (4, OpCode::ADD, 3),
            (5, OpCode::ISZERO, 0),
        ]);
        pool.rebuild();
        let deps = pool.relies(RegId(3));
        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&RegId(0)) && deps.contains(&RegId(1)) && deps.contains(&RegId(2)));
    }

    #[test]
    fn expand_renders_source_through_dup() {
        let mut pool = pool_of(&[
            (0, OpCode::PUSH1, 5),
            (2, OpCode::DUP1, 5),
            (3, OpCode::ISZERO, 0),
        ]);
        pool.rebuild();
        let tree = pool.expand(RegId(2), 0);
        assert!(tree.contains("ISZERO"));
        assert!(tree.contains("PUSH1"));
    }
}
