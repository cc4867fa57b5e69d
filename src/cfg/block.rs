use std::collections::HashMap;
use std::fmt;

use crate::evm::opcode::OpCode;
use crate::types::{u256_from_be, EVMU256};

/// Which side of a conditional jump was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondBranch {
    False = 0,
    True = 1,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub pc: u64,
    pub op: OpCode,
    /// push immediate, empty otherwise
    pub arg: Vec<u8>,
    pub live: bool,

    /// JUMP: destination -> covered
    pub jump_branch: HashMap<u64, bool>,
    /// JUMPI: destination -> [false side, true side]
    pub jumpi_branch: HashMap<u64, [bool; 2]>,

    pub sload_visit: u64,
    pub sstore_visit: u64,
}

impl Instruction {
    pub fn new(pc: u64, op: OpCode, arg: Vec<u8>) -> Self {
        Self {
            pc,
            op,
            arg,
            live: false,
            jump_branch: HashMap::new(),
            jumpi_branch: HashMap::new(),
            sload_visit: 0,
            sstore_visit: 0,
        }
    }

    /// the push immediate as a word
    pub fn value(&self) -> EVMU256 {
        u256_from_be(&self.arg)
    }

    pub fn cover_jump(&mut self, dest: u64) {
        self.jump_branch.insert(dest, true);
    }

    pub fn cover_jumpi(&mut self, dest: u64, branch: CondBranch) {
        let entry = self.jumpi_branch.entry(dest).or_insert([false, false]);
        entry[branch as usize] = true;
    }

    /// (covered, total) over the observed destination set.
    pub fn branch_coverage(&self) -> (usize, usize) {
        match self.op {
            OpCode::JUMP => {
                let covered = self.jump_branch.values().filter(|c| **c).count();
                (covered, self.jump_branch.len())
            }
            OpCode::JUMPI => {
                let covered = self
                    .jumpi_branch
                    .values()
                    .map(|sides| sides.iter().filter(|c| **c).count())
                    .sum();
                (covered, self.jumpi_branch.len() * 2)
            }
            _ => (0, 0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}({}) {}", self.pc, self.pc, self.op)?;
        if !self.arg.is_empty() {
            write!(f, " 0x{}", hex::encode(&self.arg))?;
        }
        match self.op {
            OpCode::JUMP => {
                for (dest, covered) in &self.jump_branch {
                    write!(f, " dest 0x{dest:x}:[{}]", if *covered { "x" } else { " " })?;
                }
            }
            OpCode::JUMPI => {
                for (dest, sides) in &self.jumpi_branch {
                    write!(
                        f,
                        " dest 0x{dest:x}: F[{}] T[{}]",
                        if sides[0] { "x" } else { " " },
                        if sides[1] { "x" } else { " " }
                    )?;
                }
            }
            OpCode::SLOAD | OpCode::SSTORE => {
                let visited = self.sload_visit > 0 || self.sstore_visit > 0;
                write!(f, " [{}]", if visited { "x" } else { " " })?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub index: usize,
    /// one of the dispatch blocks
    pub selector: bool,
    /// reached by symbolic execution
    pub discover: bool,
    /// reached by a concrete run
    pub live: bool,
    pub stmts: Vec<Instruction>,
    pub succs: Vec<usize>,
}

impl Block {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            selector: false,
            discover: false,
            live: false,
            stmts: Vec::new(),
            succs: Vec::new(),
        }
    }

    pub fn first_pc(&self) -> u64 {
        self.stmts.first().map(|s| s.pc).unwrap_or_default()
    }

    pub fn last(&self) -> Option<&Instruction> {
        self.stmts.last()
    }

    pub fn pcs(&self) -> Vec<u64> {
        self.stmts.iter().map(|s| s.pc).collect()
    }

    /// A concrete run reached this block: a live block keeps every statement
    /// the run walked live too (callers mark statements individually).
    pub fn alive(&mut self) {
        self.live = true;
        self.discover = true;
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags = format!(
            "{}{}{}",
            if self.selector { "(selector)" } else { "" },
            if self.live { "(live)" } else { "" },
            if self.discover { "(discover)" } else { "" },
        );
        writeln!(f, "{}Block {}:", tags, self.index)?;
        let indent = if self.live { " ".repeat(8) } else { String::new() };
        for stmt in &self.stmts {
            writeln!(f, "{indent}{stmt}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumpi_coverage_counts_both_sides_per_destination() {
        let mut i = Instruction::new(4, OpCode::JUMPI, vec![]);
        assert_eq!(i.branch_coverage(), (0, 0));
        i.cover_jumpi(9, CondBranch::True);
        assert_eq!(i.branch_coverage(), (1, 2));
        i.cover_jumpi(9, CondBranch::False);
        assert_eq!(i.branch_coverage(), (2, 2));
        i.cover_jumpi(17, CondBranch::True);
        assert_eq!(i.branch_coverage(), (3, 4));
    }

    #[test]
    fn live_implies_discover() {
        let mut b = Block::new(0);
        b.alive();
        assert!(b.live && b.discover);
    }
}
