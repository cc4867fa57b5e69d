//! Linear-scan disassembly of EVM bytecode.
//!
//! The iterator yields one instruction per step: its program counter, opcode
//! and (for the push family) the immediate bytes that follow. A push whose
//! immediate runs past the end of the code keeps the truncated tail as its
//! argument so that reassembly reproduces the input byte-for-byte.
use crate::evm::opcode::OpCode;

pub struct InstructionIterator<'a> {
    code: &'a [u8],
    pc: usize,
}

impl<'a> InstructionIterator<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pc: 0 }
    }
}

impl<'a> Iterator for InstructionIterator<'a> {
    /// (pc, opcode, push immediate)
    type Item = (u64, OpCode, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pc >= self.code.len() {
            return None;
        }
        let pc = self.pc;
        let op = OpCode(self.code[pc]);
        let imm = op.push_bytes();
        let start = pc + 1;
        let end = (start + imm).min(self.code.len());
        let arg = &self.code[start..end];
        self.pc = end;
        Some((pc as u64, op, arg))
    }
}

/// All disassembled instructions in human-readable form.
pub fn disassemble(code: &[u8]) -> Vec<String> {
    InstructionIterator::new(code)
        .map(|(pc, op, arg)| {
            if arg.is_empty() {
                format!("{pc:05x}: {op}")
            } else {
                format!("{pc:05x}: {op} 0x{}", hex::encode(arg))
            }
        })
        .collect()
}

/// Rebuild bytecode from an instruction listing. Inverse of disassembly.
pub fn assemble(instrs: &[(u64, OpCode, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (_, op, arg) in instrs {
        out.push(op.0);
        out.extend_from_slice(arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn push_add_stop() {
        // PUSH1 1, PUSH1 2, ADD, STOP
        let code = hex!("600160020100");
        let instrs: Vec<_> = InstructionIterator::new(&code).collect();
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[0], (0, OpCode::PUSH1, &[0x01u8][..]));
        assert_eq!(instrs[1], (2, OpCode::PUSH1, &[0x02u8][..]));
        assert_eq!(instrs[2], (4, OpCode::ADD, &[][..]));
        assert_eq!(instrs[3], (5, OpCode::STOP, &[][..]));
    }

    #[test]
    fn disassemble_assemble_is_identity() {
        let cases: Vec<Vec<u8>> = vec![
            hex!("600160020100").to_vec(),
            hex!("608060405260043610").to_vec(),
            // truncated PUSH32 at the tail
            hex!("60015b7f0102").to_vec(),
            vec![],
        ];
        for code in cases {
            let instrs: Vec<_> = InstructionIterator::new(&code)
                .map(|(pc, op, arg)| (pc, op, arg.to_vec()))
                .collect();
            assert_eq!(assemble(&instrs), code);
        }
    }

    #[test]
    fn listing_is_stable() {
        let code = hex!("6003565b00");
        assert_eq!(
            disassemble(&code),
            vec![
                "00000: PUSH1 0x03".to_string(),
                "00002: JUMP".to_string(),
                "00003: JUMPDEST".to_string(),
                "00004: STOP".to_string(),
            ]
        );
    }
}
