//! Decoding of EVM bytecode into a closed set of instructions.

use crate::{
    expr::{BinaryOp, TernaryOp, UnaryOp},
    word::U256,
};
use std::{collections::BTreeSet, fmt, fs, path::Path};
use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};
use thiserror::Error;

/// Largest accepted code size (the EIP-3860 init-code limit).
pub const MAX_CODE_SIZE: usize = 0xc000;

const INVALID: u8 = 0xfe;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisassemblyError {
    #[error("bytecode is empty")]
    Empty,

    #[error("bytecode of {0} bytes exceeds the maximum code size")]
    TooLarge(usize),

    #[error("PUSH{size} at offset {offset} runs past the end of the code")]
    TruncatedPush { offset: usize, size: usize },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("failed to read bytecode file: {0}")]
    Io(String),
}

/// Context values pushed by instructions without operands.
#[derive(Clone, Copy, Debug, Display, EnumIter, IntoStaticStr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "UPPERCASE")]
pub enum EnvOp {
    Address,
    Origin,
    Caller,
    CallValue,
    CallDataSize,
    CodeSize,
    GasPrice,
    ReturnDataSize,
    Coinbase,
    Timestamp,
    Number,
    PrevRandao,
    GasLimit,
    ChainId,
    SelfBalance,
    BaseFee,
    Pc,
    MSize,
    Gas,
}

#[derive(Clone, Copy, Debug, Display, IntoStaticStr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

impl CallKind {
    /// `CALL` and `CALLCODE` carry a value operand.
    pub fn has_value(self) -> bool {
        matches!(self, CallKind::Call | CallKind::CallCode)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Stop,
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Keccak256,
    Environment(EnvOp),
    Balance,
    ExtCodeSize,
    CallDataLoad,
    CallDataCopy,
    CodeCopy,
    ReturnDataCopy,
    Pop,
    MLoad,
    MStore,
    MStore8,
    SLoad,
    SStore,
    Jump,
    JumpI,
    JumpDest,
    Push { size: u8, value: U256 },
    Dup(u8),
    Swap(u8),
    Log(u8),
    Call(CallKind),
    Return,
    Revert,
    Invalid,
    SelfDestruct,
    /// A valid opcode outside of the supported subset.
    NotImplemented(u8),
    Unknown(u8),
}

fn env_opcode(op: EnvOp) -> u8 {
    match op {
        EnvOp::Address => 0x30,
        EnvOp::Origin => 0x32,
        EnvOp::Caller => 0x33,
        EnvOp::CallValue => 0x34,
        EnvOp::CallDataSize => 0x36,
        EnvOp::CodeSize => 0x38,
        EnvOp::GasPrice => 0x3a,
        EnvOp::ReturnDataSize => 0x3d,
        EnvOp::Coinbase => 0x41,
        EnvOp::Timestamp => 0x42,
        EnvOp::Number => 0x43,
        EnvOp::PrevRandao => 0x44,
        EnvOp::GasLimit => 0x45,
        EnvOp::ChainId => 0x46,
        EnvOp::SelfBalance => 0x47,
        EnvOp::BaseFee => 0x48,
        EnvOp::Pc => 0x58,
        EnvOp::MSize => 0x59,
        EnvOp::Gas => 0x5a,
    }
}

fn decode(byte: u8) -> Instruction {
    use Instruction::*;

    match byte {
        0x00 => Stop,
        0x01 => Binary(BinaryOp::Add),
        0x02 => Binary(BinaryOp::Mul),
        0x03 => Binary(BinaryOp::Sub),
        0x04 => Binary(BinaryOp::Div),
        0x05 => Binary(BinaryOp::SDiv),
        0x06 => Binary(BinaryOp::Mod),
        0x07 => Binary(BinaryOp::SMod),
        0x08 => Ternary(TernaryOp::AddMod),
        0x09 => Ternary(TernaryOp::MulMod),
        0x0a => Binary(BinaryOp::Exp),
        0x0b => Binary(BinaryOp::SignExtend),
        0x10 => Binary(BinaryOp::Lt),
        0x11 => Binary(BinaryOp::Gt),
        0x12 => Binary(BinaryOp::SLt),
        0x13 => Binary(BinaryOp::SGt),
        0x14 => Binary(BinaryOp::Eq),
        0x15 => Unary(UnaryOp::IsZero),
        0x16 => Binary(BinaryOp::And),
        0x17 => Binary(BinaryOp::Or),
        0x18 => Binary(BinaryOp::Xor),
        0x19 => Unary(UnaryOp::Not),
        0x1a => Binary(BinaryOp::Byte),
        0x1b => Binary(BinaryOp::Shl),
        0x1c => Binary(BinaryOp::Shr),
        0x1d => Binary(BinaryOp::Sar),
        0x20 => Keccak256,
        0x31 => Balance,
        0x35 => CallDataLoad,
        0x37 => CallDataCopy,
        0x39 => CodeCopy,
        0x3b => ExtCodeSize,
        0x3e => ReturnDataCopy,
        0x50 => Pop,
        0x51 => MLoad,
        0x52 => MStore,
        0x53 => MStore8,
        0x54 => SLoad,
        0x55 => SStore,
        0x56 => Jump,
        0x57 => JumpI,
        0x5b => JumpDest,
        0x5f..=0x7f => Push {
            size: byte - 0x5f,
            value: U256::ZERO,
        },
        0x80..=0x8f => Dup(byte - 0x7f),
        0x90..=0x9f => Swap(byte - 0x8f),
        0xa0..=0xa4 => Log(byte - 0xa0),
        0xf1 => Call(CallKind::Call),
        0xf2 => Call(CallKind::CallCode),
        0xf3 => Return,
        0xf4 => Call(CallKind::DelegateCall),
        0xfa => Call(CallKind::StaticCall),
        0xfd => Revert,
        INVALID => Invalid,
        0xff => SelfDestruct,
        0x3c | 0x3f | 0x40 | 0x49 | 0x4a | 0x5c | 0x5d | 0x5e | 0xf0 | 0xf5 => NotImplemented(byte),
        _ => EnvOp::iter()
            .find(|op| env_opcode(*op) == byte)
            .map_or(Unknown(byte), Environment),
    }
}

fn not_implemented_mnemonic(byte: u8) -> Option<&'static str> {
    Some(match byte {
        0x3c => "EXTCODECOPY",
        0x3f => "EXTCODEHASH",
        0x40 => "BLOCKHASH",
        0x49 => "BLOBHASH",
        0x4a => "BLOBBASEFEE",
        0x5c => "TLOAD",
        0x5d => "TSTORE",
        0x5e => "MCOPY",
        0xf0 => "CREATE",
        0xf5 => "CREATE2",
        _ => return None,
    })
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::Unary(op) => write!(f, "{}", op.to_string().to_uppercase()),
            Instruction::Binary(op) => write!(f, "{}", op.to_string().to_uppercase()),
            Instruction::Ternary(op) => write!(f, "{}", op.to_string().to_uppercase()),
            Instruction::Environment(op) => write!(f, "{}", op),
            Instruction::Call(kind) => write!(f, "{}", kind),
            Instruction::Push { size: 0, .. } => write!(f, "PUSH0"),
            Instruction::Push { size, value } => write!(f, "PUSH{} {:#x}", size, value),
            Instruction::Dup(n) => write!(f, "DUP{}", n),
            Instruction::Swap(n) => write!(f, "SWAP{}", n),
            Instruction::Log(n) => write!(f, "LOG{}", n),
            Instruction::NotImplemented(byte) => {
                write!(f, "{}", not_implemented_mnemonic(*byte).unwrap_or("?"))
            }
            Instruction::Unknown(byte) => write!(f, "UNKNOWN({:#04x})", byte),
            other => write!(f, "{}", format!("{:?}", other).to_uppercase()),
        }
    }
}

/// Textual mnemonic of a single opcode byte, `None` for undefined bytes.
pub fn mnemonic(byte: u8) -> Option<String> {
    match decode(byte) {
        Instruction::Unknown(_) => None,
        Instruction::Push { size, .. } => Some(format!("PUSH{}", size)),
        instruction => Some(instruction.to_string()),
    }
}

/// Opcode byte for a mnemonic, the inverse of [`mnemonic`].
pub fn opcode(name: &str) -> Option<u8> {
    let name = name.to_uppercase();

    (0..=u8::MAX).find(|byte| mnemonic(*byte).as_deref() == Some(name.as_str()))
}

/// Decoded program, indexed by byte offset.
#[derive(Clone, Debug)]
pub struct Program {
    bytecode: Vec<u8>,
    // `None` for bytes that belong to a PUSH payload
    instructions: Vec<Option<Instruction>>,
    jumpdests: BTreeSet<usize>,
}

impl Program {
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn len(&self) -> usize {
        self.bytecode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }

    /// Instruction starting at `pc`. Offsets past the end decode as `STOP`.
    pub fn instruction(&self, pc: usize) -> Option<&Instruction> {
        const STOP: Instruction = Instruction::Stop;

        match self.instructions.get(pc) {
            Some(i) => i.as_ref(),
            None => Some(&STOP),
        }
    }

    pub fn is_jumpdest(&self, pc: usize) -> bool {
        self.jumpdests.contains(&pc)
    }

    pub fn jumpdests(&self) -> impl Iterator<Item = usize> + '_ {
        self.jumpdests.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Instruction)> + '_ {
        self.instructions
            .iter()
            .enumerate()
            .filter_map(|(pc, i)| i.as_ref().map(|i| (pc, i)))
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.iter()
            .try_for_each(|(pc, instruction)| writeln!(f, "{:#06x}: {}", pc, instruction))
    }
}

/// Decodes `bytecode`. A PUSH that runs past the end of the code is rejected,
/// unless it follows the first `INVALID`, which separates the code from the
/// data trailer appended by compilers; such payloads are zero padded.
pub fn disassemble(bytecode: &[u8]) -> Result<Program, DisassemblyError> {
    if bytecode.is_empty() {
        return Err(DisassemblyError::Empty);
    }
    if bytecode.len() > MAX_CODE_SIZE {
        return Err(DisassemblyError::TooLarge(bytecode.len()));
    }

    let mut instructions = vec![None; bytecode.len()];
    let mut jumpdests = BTreeSet::new();
    let mut in_trailer = false;
    let mut pc = 0;

    while pc < bytecode.len() {
        let mut instruction = decode(bytecode[pc]);
        let mut width = 1;

        match &mut instruction {
            Instruction::Push { size, value } => {
                let size_bytes = usize::from(*size);
                let end = pc + 1 + size_bytes;

                if end > bytecode.len() && !in_trailer {
                    return Err(DisassemblyError::TruncatedPush {
                        offset: pc,
                        size: size_bytes,
                    });
                }

                let mut buffer = [0_u8; 32];
                let available = &bytecode[(pc + 1).min(bytecode.len())..end.min(bytecode.len())];

                buffer[32 - size_bytes..32 - size_bytes + available.len()].copy_from_slice(available);
                *value = U256::from_be_bytes(buffer);
                width += size_bytes;
            }
            Instruction::JumpDest => {
                jumpdests.insert(pc);
            }
            Instruction::Invalid => in_trailer = true,
            _ => {}
        }

        instructions[pc] = Some(instruction);
        pc += width;
    }

    Ok(Program {
        bytecode: bytecode.to_vec(),
        instructions,
        jumpdests,
    })
}

/// Parses hex text, with optional `0x` prefix and arbitrary whitespace.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, DisassemblyError> {
    let digits = text.split_whitespace().collect::<String>();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);

    hex::decode(digits).map_err(|e| DisassemblyError::InvalidHex(e.to_string()))
}

pub fn load_hex<P>(path: P) -> Result<Vec<u8>, DisassemblyError>
where
    P: AsRef<Path>,
{
    let text = fs::read_to_string(path).map_err(|e| DisassemblyError::Io(e.to_string()))?;

    parse_hex(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_push_payloads_and_jumpdests() {
        // PUSH1 0x04 JUMP INVALID JUMPDEST PUSH2 0x0102 STOP
        let program = disassemble(&[0x60, 0x04, 0x56, 0xfe, 0x5b, 0x61, 0x01, 0x02, 0x00])
            .expect("valid bytecode");

        assert_eq!(
            program.instruction(0),
            Some(&Instruction::Push {
                size: 1,
                value: U256::from(4_u64)
            })
        );
        assert_eq!(program.instruction(1), None, "payload byte is not an instruction");
        assert!(program.is_jumpdest(4));
        assert!(!program.is_jumpdest(1));
        assert_eq!(
            program.instruction(5),
            Some(&Instruction::Push {
                size: 2,
                value: U256::from(0x0102_u64)
            })
        );
        assert_eq!(program.instruction(100), Some(&Instruction::Stop));
    }

    #[test]
    fn jumpdest_inside_push_payload_is_not_a_target() {
        let program = disassemble(&[0x60, 0x5b, 0x00]).expect("valid bytecode");

        assert!(!program.is_jumpdest(1));
    }

    #[test]
    fn rejects_malformed_bytecode() {
        assert_eq!(disassemble(&[]).unwrap_err(), DisassemblyError::Empty);
        assert_eq!(
            disassemble(&[0x00, 0x62, 0x01]).unwrap_err(),
            DisassemblyError::TruncatedPush { offset: 1, size: 3 }
        );
        assert!(matches!(
            disassemble(&vec![0; MAX_CODE_SIZE + 1]),
            Err(DisassemblyError::TooLarge(_))
        ));
    }

    #[test]
    fn truncated_push_in_data_trailer_is_padded() {
        let program = disassemble(&[0x00, 0xfe, 0x61, 0x01]).expect("trailer is tolerated");

        assert_eq!(
            program.instruction(2),
            Some(&Instruction::Push {
                size: 2,
                value: U256::from(0x0100_u64)
            })
        );
    }

    #[test]
    fn mnemonics_round_trip_through_opcodes() {
        assert_eq!(mnemonic(0x01).as_deref(), Some("ADD"));
        assert_eq!(mnemonic(0x15).as_deref(), Some("ISZERO"));
        assert_eq!(mnemonic(0x33).as_deref(), Some("CALLER"));
        assert_eq!(mnemonic(0x5f).as_deref(), Some("PUSH0"));
        assert_eq!(mnemonic(0x7f).as_deref(), Some("PUSH32"));
        assert_eq!(mnemonic(0xf4).as_deref(), Some("DELEGATECALL"));
        assert_eq!(mnemonic(0xf0).as_deref(), Some("CREATE"));
        assert_eq!(mnemonic(0x0c), None);

        for byte in 0..=u8::MAX {
            if let Some(name) = mnemonic(byte) {
                assert_eq!(opcode(&name), Some(byte), "opcode of {}", name);
            }
        }
    }

    #[test]
    fn parses_hex_text() {
        assert_eq!(parse_hex("0x6001\n 00").expect("valid"), vec![0x60, 0x01, 0x00]);
        assert!(matches!(parse_hex("0x6"), Err(DisassemblyError::InvalidHex(_))));
    }
}
