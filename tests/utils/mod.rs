#![allow(dead_code)]

use sevm::{
    disassemble::opcode,
    engine::{
        memory::{Storage, WorldState},
        state::defaults::CONTRACT_ADDRESS,
        Entry,
    },
    expr::keccak256,
    util::parse_u256,
    word::U256,
};
use std::{collections::HashMap, sync::Once};
use tempfile::{tempdir, TempDir};

static INIT_LOGGER: Once = Once::new();

pub fn init() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn with_temp_dir<F>(f: F)
where
    F: FnOnce(&TempDir),
{
    let dir = tempdir().expect("can create temp dir");

    f(&dir);
}

/// Assembles whitespace separated mnemonics into bytecode.
///
/// `name:` marks the offset of the next instruction, `PUSHn :name` pushes
/// that offset. Every other `PUSHn` takes a decimal or `0x` literal.
pub fn assemble(source: &str) -> Vec<u8> {
    let mut code = Vec::new();
    let mut labels = HashMap::new();
    let mut fixups = Vec::new();
    let mut tokens = source
        .lines()
        .map(|line| line.split(';').next().unwrap_or(""))
        .flat_map(str::split_whitespace);

    while let Some(token) = tokens.next() {
        if let Some(label) = token.strip_suffix(':') {
            labels.insert(label.to_string(), code.len());
            continue;
        }

        let byte = opcode(token).unwrap_or_else(|| panic!("unknown mnemonic {}", token));
        code.push(byte);

        if (0x60..=0x7f).contains(&byte) {
            let size = usize::from(byte - 0x5f);
            let operand = tokens
                .next()
                .unwrap_or_else(|| panic!("{} needs an operand", token));

            if let Some(label) = operand.strip_prefix(':') {
                fixups.push((code.len(), size, label.to_string()));
                code.extend(vec![0; size]);
            } else {
                let value = parse_u256(operand).unwrap_or_else(|| panic!("invalid literal {}", operand));
                code.extend_from_slice(&value.to_be_bytes()[32 - size..]);
            }
        }
    }

    for (offset, size, label) in fixups {
        let target = labels
            .get(&label)
            .unwrap_or_else(|| panic!("undefined label {}", label));
        let bytes = (*target as u64).to_be_bytes();

        code[offset..offset + size].copy_from_slice(&bytes[8 - size..]);
    }

    code
}

pub const BUG_EVENT: &str = "AssertionFailed(string)";

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes()).to_be_bytes();

    [hash[0], hash[1], hash[2], hash[3]]
}

fn dispatch(signature: &str) -> String {
    format!(
        "
        PUSH1 0 CALLDATALOAD PUSH1 0xe0 SHR
        PUSH4 0x{} EQ PUSH2 :body JUMPI
        PUSH1 0 DUP1 REVERT
        body: JUMPDEST
        ",
        hex::encode(selector(signature))
    )
}

fn emit_bug() -> String {
    format!(
        "
        PUSH1 1 PUSH1 0 SSTORE          ; flag = 1
        PUSH32 0x{:x} PUSH1 0 DUP1 LOG1
        STOP
        ",
        keccak256(BUG_EVENT.as_bytes())
    )
}

/// `process(a)` with `a > 200 && a < 210` evaluated into a single guard.
pub fn process_single_guard() -> Vec<u8> {
    assemble(&format!(
        "{}
        PUSH1 4 CALLDATALOAD            ; a
        DUP1 PUSH1 200 LT               ; 200 < a
        SWAP1 PUSH1 210 GT              ; 210 > a
        AND
        PUSH2 :bug JUMPI
        PUSH1 0 DUP1 REVERT
        bug: JUMPDEST
        {}",
        dispatch("process(uint256)"),
        emit_bug()
    ))
}

/// `process(a)` with the short circuit of `&&` lowered to two branches.
pub fn process_sequential_guards() -> Vec<u8> {
    assemble(&format!(
        "{}
        PUSH1 4 CALLDATALOAD            ; a
        PUSH1 200 DUP2 GT ISZERO        ; !(a > 200)
        PUSH2 :fail JUMPI
        PUSH1 210 DUP2 LT ISZERO        ; !(a < 210)
        PUSH2 :fail JUMPI
        {}
        fail: JUMPDEST
        PUSH1 0 DUP1 REVERT
        ",
        dispatch("process(uint256)"),
        emit_bug()
    ))
}

pub fn process_entry() -> Entry {
    Entry::new(CONTRACT_ADDRESS, Some(selector("process(uint256)"))).with_symbolic_arguments(1)
}

pub fn world(code: &[u8]) -> WorldState {
    sevm::deploy(code, CONTRACT_ADDRESS, Storage::new()).expect("fixture is valid bytecode")
}

pub fn u256(v: u64) -> U256 {
    U256::from(v)
}
