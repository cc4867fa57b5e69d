use std::fmt;

/// A single EVM opcode byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpCode(pub u8);

macro_rules! opcodes {
    ($($name:ident = $byte:expr;)*) => {
        impl OpCode {
            $(pub const $name: OpCode = OpCode($byte);)*
        }
    };
}

opcodes! {
    STOP = 0x00;
    ADD = 0x01;
    MUL = 0x02;
    SUB = 0x03;
    DIV = 0x04;
    SDIV = 0x05;
    MOD = 0x06;
    SMOD = 0x07;
    ADDMOD = 0x08;
    MULMOD = 0x09;
    EXP = 0x0a;
    SIGNEXTEND = 0x0b;
    LT = 0x10;
    GT = 0x11;
    SLT = 0x12;
    SGT = 0x13;
    EQ = 0x14;
    ISZERO = 0x15;
    AND = 0x16;
    OR = 0x17;
    XOR = 0x18;
    NOT = 0x19;
    BYTE = 0x1a;
    SHL = 0x1b;
    SHR = 0x1c;
    SAR = 0x1d;
    KECCAK256 = 0x20;
    ADDRESS = 0x30;
    BALANCE = 0x31;
    ORIGIN = 0x32;
    CALLER = 0x33;
    CALLVALUE = 0x34;
    CALLDATALOAD = 0x35;
    CALLDATASIZE = 0x36;
    CALLDATACOPY = 0x37;
    CODESIZE = 0x38;
    CODECOPY = 0x39;
    GASPRICE = 0x3a;
    EXTCODESIZE = 0x3b;
    EXTCODECOPY = 0x3c;
    RETURNDATASIZE = 0x3d;
    RETURNDATACOPY = 0x3e;
    EXTCODEHASH = 0x3f;
    BLOCKHASH = 0x40;
    COINBASE = 0x41;
    TIMESTAMP = 0x42;
    NUMBER = 0x43;
    PREVRANDAO = 0x44;
    GASLIMIT = 0x45;
    CHAINID = 0x46;
    SELFBALANCE = 0x47;
    BASEFEE = 0x48;
    POP = 0x50;
    MLOAD = 0x51;
    MSTORE = 0x52;
    MSTORE8 = 0x53;
    SLOAD = 0x54;
    SSTORE = 0x55;
    JUMP = 0x56;
    JUMPI = 0x57;
    PC = 0x58;
    MSIZE = 0x59;
    GAS = 0x5a;
    JUMPDEST = 0x5b;
    PUSH0 = 0x5f;
    PUSH1 = 0x60;
    PUSH2 = 0x61;
    PUSH4 = 0x63;
    PUSH32 = 0x7f;
    DUP1 = 0x80;
    DUP16 = 0x8f;
    SWAP1 = 0x90;
    SWAP16 = 0x9f;
    LOG0 = 0xa0;
    LOG4 = 0xa4;
    CREATE = 0xf0;
    CALL = 0xf1;
    CALLCODE = 0xf2;
    RETURN = 0xf3;
    DELEGATECALL = 0xf4;
    CREATE2 = 0xf5;
    STATICCALL = 0xfa;
    REVERT = 0xfd;
    INVALID = 0xfe;
    SELFDESTRUCT = 0xff;
}

impl OpCode {
    pub fn is_push(self) -> bool {
        self.0 == 0x5f || (0x60..=0x7f).contains(&self.0)
    }

    /// Immediate bytes following a push opcode (0 for PUSH0 and everything else).
    pub fn push_bytes(self) -> usize {
        if (0x60..=0x7f).contains(&self.0) {
            (self.0 - 0x5f) as usize
        } else {
            0
        }
    }

    pub fn is_dup(self) -> bool {
        (0x80..=0x8f).contains(&self.0)
    }

    /// 1-based depth for DUPn
    pub fn dup_n(self) -> usize {
        (self.0 - 0x7f) as usize
    }

    pub fn is_swap(self) -> bool {
        (0x90..=0x9f).contains(&self.0)
    }

    /// 1-based depth below top for SWAPn
    pub fn swap_n(self) -> usize {
        (self.0 - 0x8f) as usize
    }

    pub fn is_log(self) -> bool {
        (0xa0..=0xa4).contains(&self.0)
    }

    pub fn log_n(self) -> usize {
        (self.0 - 0xa0) as usize
    }

    /// Ends execution of the current frame.
    pub fn is_halt(self) -> bool {
        matches!(
            self,
            OpCode::STOP | OpCode::RETURN | OpCode::REVERT | OpCode::INVALID | OpCode::SELFDESTRUCT
        )
    }

    /// Ends a basic block.
    pub fn is_terminator(self) -> bool {
        self == OpCode::JUMP || self == OpCode::JUMPI || self.is_halt()
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            OpCode::CALL | OpCode::CALLCODE | OpCode::DELEGATECALL | OpCode::STATICCALL
        )
    }

    /// Declared stack behaviour: (items consumed, items produced).
    pub fn stack_io(self) -> (usize, usize) {
        match self.0 {
            0x00 => (0, 0),                       // STOP
            0x01..=0x07 => (2, 1),                // ADD..SMOD
            0x08 | 0x09 => (3, 1),                // ADDMOD MULMOD
            0x0a | 0x0b => (2, 1),                // EXP SIGNEXTEND
            0x10..=0x14 => (2, 1),                // LT..EQ
            0x15 => (1, 1),                       // ISZERO
            0x16..=0x18 => (2, 1),                // AND OR XOR
            0x19 => (1, 1),                       // NOT
            0x1a..=0x1d => (2, 1),                // BYTE SHL SHR SAR
            0x20 => (2, 1),                       // KECCAK256
            0x30 => (0, 1),                       // ADDRESS
            0x31 => (1, 1),                       // BALANCE
            0x32..=0x34 => (0, 1),                // ORIGIN CALLER CALLVALUE
            0x35 => (1, 1),                       // CALLDATALOAD
            0x36 => (0, 1),                       // CALLDATASIZE
            0x37 => (3, 0),                       // CALLDATACOPY
            0x38 => (0, 1),                       // CODESIZE
            0x39 => (3, 0),                       // CODECOPY
            0x3a => (0, 1),                       // GASPRICE
            0x3b => (1, 1),                       // EXTCODESIZE
            0x3c => (4, 0),                       // EXTCODECOPY
            0x3d => (0, 1),                       // RETURNDATASIZE
            0x3e => (3, 0),                       // RETURNDATACOPY
            0x3f => (1, 1),                       // EXTCODEHASH
            0x40 => (1, 1),                       // BLOCKHASH
            0x41..=0x48 => (0, 1),                // COINBASE..BASEFEE
            0x50 => (1, 0),                       // POP
            0x51 => (1, 1),                       // MLOAD
            0x52 | 0x53 => (2, 0),                // MSTORE MSTORE8
            0x54 => (1, 1),                       // SLOAD
            0x55 => (2, 0),                       // SSTORE
            0x56 => (1, 0),                       // JUMP
            0x57 => (2, 0),                       // JUMPI
            0x58..=0x5a => (0, 1),                // PC MSIZE GAS
            0x5b => (0, 0),                       // JUMPDEST
            0x5f..=0x7f => (0, 1),                // PUSH0..PUSH32
            0x80..=0x8f => {
                let n = self.dup_n();
                (n, n + 1)
            }
            0x90..=0x9f => {
                let n = self.swap_n();
                (n + 1, n + 1)
            }
            0xa0..=0xa4 => (self.log_n() + 2, 0), // LOG0..LOG4
            0xf0 => (3, 1),                       // CREATE
            0xf1 | 0xf2 => (7, 1),                // CALL CALLCODE
            0xf3 => (2, 0),                       // RETURN
            0xf4 => (6, 1),                       // DELEGATECALL
            0xf5 => (4, 1),                       // CREATE2
            0xfa => (6, 1),                       // STATICCALL
            0xfd => (2, 0),                       // REVERT
            0xfe => (0, 0),                       // INVALID
            0xff => (1, 0),                       // SELFDESTRUCT
            _ => (0, 0),
        }
    }

    /// Parameter/pushback counts recorded on a register. DUP and SWAP keep
    /// their `cp` link instead of stack parents, so they are declared with a
    /// single reference slot and one produced value.
    pub fn reg_arity(self) -> (usize, usize) {
        if self.is_dup() {
            (1, 1)
        } else if self.is_swap() {
            (2, 1)
        } else {
            self.stack_io()
        }
    }

    pub fn is_valid(self) -> bool {
        self.name() != "UNKNOWN"
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0x00 => "STOP",
            0x01 => "ADD",
            0x02 => "MUL",
            0x03 => "SUB",
            0x04 => "DIV",
            0x05 => "SDIV",
            0x06 => "MOD",
            0x07 => "SMOD",
            0x08 => "ADDMOD",
            0x09 => "MULMOD",
            0x0a => "EXP",
            0x0b => "SIGNEXTEND",
            0x10 => "LT",
            0x11 => "GT",
            0x12 => "SLT",
            0x13 => "SGT",
            0x14 => "EQ",
            0x15 => "ISZERO",
            0x16 => "AND",
            0x17 => "OR",
            0x18 => "XOR",
            0x19 => "NOT",
            0x1a => "BYTE",
            0x1b => "SHL",
            0x1c => "SHR",
            0x1d => "SAR",
            0x20 => "KECCAK256",
            0x30 => "ADDRESS",
            0x31 => "BALANCE",
            0x32 => "ORIGIN",
            0x33 => "CALLER",
            0x34 => "CALLVALUE",
            0x35 => "CALLDATALOAD",
            0x36 => "CALLDATASIZE",
            0x37 => "CALLDATACOPY",
            0x38 => "CODESIZE",
            0x39 => "CODECOPY",
            0x3a => "GASPRICE",
            0x3b => "EXTCODESIZE",
            0x3c => "EXTCODECOPY",
            0x3d => "RETURNDATASIZE",
            0x3e => "RETURNDATACOPY",
            0x3f => "EXTCODEHASH",
            0x40 => "BLOCKHASH",
            0x41 => "COINBASE",
            0x42 => "TIMESTAMP",
            0x43 => "NUMBER",
            0x44 => "PREVRANDAO",
            0x45 => "GASLIMIT",
            0x46 => "CHAINID",
            0x47 => "SELFBALANCE",
            0x48 => "BASEFEE",
            0x50 => "POP",
            0x51 => "MLOAD",
            0x52 => "MSTORE",
            0x53 => "MSTORE8",
            0x54 => "SLOAD",
            0x55 => "SSTORE",
            0x56 => "JUMP",
            0x57 => "JUMPI",
            0x58 => "PC",
            0x59 => "MSIZE",
            0x5a => "GAS",
            0x5b => "JUMPDEST",
            0x5f => "PUSH0",
            0x60..=0x7f => {
                const PUSH_NAMES: [&str; 32] = [
                    "PUSH1", "PUSH2", "PUSH3", "PUSH4", "PUSH5", "PUSH6", "PUSH7", "PUSH8",
                    "PUSH9", "PUSH10", "PUSH11", "PUSH12", "PUSH13", "PUSH14", "PUSH15", "PUSH16",
                    "PUSH17", "PUSH18", "PUSH19", "PUSH20", "PUSH21", "PUSH22", "PUSH23", "PUSH24",
                    "PUSH25", "PUSH26", "PUSH27", "PUSH28", "PUSH29", "PUSH30", "PUSH31", "PUSH32",
                ];
                PUSH_NAMES[(self.0 - 0x60) as usize]
            }
            0x80..=0x8f => {
                const DUP_NAMES: [&str; 16] = [
                    "DUP1", "DUP2", "DUP3", "DUP4", "DUP5", "DUP6", "DUP7", "DUP8", "DUP9",
                    "DUP10", "DUP11", "DUP12", "DUP13", "DUP14", "DUP15", "DUP16",
                ];
                DUP_NAMES[(self.0 - 0x80) as usize]
            }
            0x90..=0x9f => {
                const SWAP_NAMES: [&str; 16] = [
                    "SWAP1", "SWAP2", "SWAP3", "SWAP4", "SWAP5", "SWAP6", "SWAP7", "SWAP8",
                    "SWAP9", "SWAP10", "SWAP11", "SWAP12", "SWAP13", "SWAP14", "SWAP15", "SWAP16",
                ];
                SWAP_NAMES[(self.0 - 0x90) as usize]
            }
            0xa0..=0xa4 => {
                const LOG_NAMES: [&str; 5] = ["LOG0", "LOG1", "LOG2", "LOG3", "LOG4"];
                LOG_NAMES[(self.0 - 0xa0) as usize]
            }
            0xf0 => "CREATE",
            0xf1 => "CALL",
            0xf2 => "CALLCODE",
            0xf3 => "RETURN",
            0xf4 => "DELEGATECALL",
            0xf5 => "CREATE2",
            0xfa => "STATICCALL",
            0xfd => "REVERT",
            0xfe => "INVALID",
            0xff => "SELFDESTRUCT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_family_shape() {
        assert!(OpCode::PUSH0.is_push());
        assert_eq!(OpCode::PUSH0.push_bytes(), 0);
        assert_eq!(OpCode::PUSH1.push_bytes(), 1);
        assert_eq!(OpCode::PUSH32.push_bytes(), 32);
        assert_eq!(OpCode::PUSH2.stack_io(), (0, 1));
    }

    #[test]
    fn dup_swap_depths() {
        assert_eq!(OpCode(0x80).dup_n(), 1);
        assert_eq!(OpCode(0x8f).dup_n(), 16);
        assert_eq!(OpCode(0x90).swap_n(), 1);
        assert_eq!(OpCode(0x9f).swap_n(), 16);
    }

    #[test]
    fn terminators() {
        for op in [
            OpCode::JUMP,
            OpCode::JUMPI,
            OpCode::STOP,
            OpCode::RETURN,
            OpCode::REVERT,
            OpCode::INVALID,
            OpCode::SELFDESTRUCT,
        ] {
            assert!(op.is_terminator(), "{op} must end a block");
        }
        assert!(!OpCode::ADD.is_terminator());
    }
}
