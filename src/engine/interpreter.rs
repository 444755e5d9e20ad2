//! The symbolic VM. Runs one execution state until it either reaches a
//! branch on a symbolic guard or terminates.

use super::{
    finding::{Bound, Cause, FindingKind, PANIC_SELECTOR},
    memory::{assemble_word, ByteMap, Cell},
    options::ExplorationOptions,
    state::{ExecutionState, Frame, ReturnTarget},
    watchdog::Watchdog,
};
use crate::{
    disassemble::{mnemonic, CallKind, EnvOp, Instruction},
    expr::{keccak256, ExprBuilder},
    word::{self, Word, U256, WORD_BYTES},
};
use log::{trace, warn};
use std::collections::BTreeSet;
use thiserror::Error;

pub const STACK_LIMIT: usize = 1024;
/// Highest addressable memory offset (exclusive).
pub const MEMORY_LIMIT: u64 = 1 << 24;

/// Why a single step could not complete.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(String),

    #[error("symbolic {0} is not supported")]
    SymbolicOperand(&'static str),

    #[error("{0} bound exceeded")]
    BoundExceeded(Bound),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow")]
    StackOverflow,

    #[error("invalid jump destination {0:#x}")]
    InvalidJump(U256),

    #[error("memory access beyond {0:#x}")]
    MemoryLimit(u64),

    #[error("state modification in static context")]
    StaticViolation,

    #[error("return data access out of bounds")]
    ReturnDataOutOfBounds,
}

/// Interpreter configuration derived from the exploration options.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub max_instructions: u64,
    pub max_call_depth: usize,
    pub watched_topics: BTreeSet<U256>,
    pub watched_addresses: BTreeSet<usize>,
    pub selfdestruct_is_violation: bool,
}

impl From<&ExplorationOptions> for Settings {
    fn from(options: &ExplorationOptions) -> Self {
        Self {
            max_instructions: options.max_instructions,
            max_call_depth: options.max_call_depth,
            watched_topics: options.watched_topics().into_iter().collect(),
            watched_addresses: options.watch_addresses.iter().copied().collect(),
            selfdestruct_is_violation: options.selfdestruct_is_violation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Termination {
    pub kind: FindingKind,
    pub cause: Cause,
}

impl Termination {
    pub fn new(kind: FindingKind, cause: Cause) -> Self {
        Self { kind, cause }
    }
}

#[derive(Debug)]
pub enum Transition {
    /// Both successors of a symbolic branch, with the guard respectively its
    /// negation appended to their path conditions. Neither has been checked
    /// for feasibility yet.
    Branched {
        taken: Box<ExecutionState>,
        not_taken: Box<ExecutionState>,
    },
    Terminal(Box<ExecutionState>, Termination),
}

enum Step {
    Continue,
    Branch { guard: Word, target: Result<usize, Fault> },
    Halt(Halt),
}

enum Halt {
    Stop,
    Return(Vec<Cell>),
    Revert(Vec<Cell>),
    Invalid,
    SelfDestruct(Word),
    Event(Vec<Word>),
    WatchedAddress,
}

fn pop(stack: &mut Vec<Word>) -> Result<Word, Fault> {
    stack.pop().ok_or(Fault::StackUnderflow)
}

fn push(stack: &mut Vec<Word>, w: Word) -> Result<(), Fault> {
    if stack.len() >= STACK_LIMIT {
        return Err(Fault::StackOverflow);
    }
    stack.push(w);
    Ok(())
}

fn concrete(w: &Word, what: &'static str) -> Result<U256, Fault> {
    w.as_concrete().ok_or(Fault::SymbolicOperand(what))
}

/// Validates a memory range. Empty ranges never touch memory.
fn range(offset: &Word, size: &Word) -> Result<(u64, u64), Fault> {
    let size = concrete(size, "memory size")?;

    if size == U256::ZERO {
        return Ok((0, 0));
    }

    let offset = concrete(offset, "memory offset")?;

    match (word::to_u64(offset), word::to_u64(size)) {
        (Some(o), Some(s)) if o.saturating_add(s) <= MEMORY_LIMIT => Ok((o, s)),
        _ => Err(Fault::MemoryLimit(MEMORY_LIMIT)),
    }
}

/// Offset into a read-only byte source; anything beyond reads as zero.
fn source_offset(offset: &Word, what: &'static str) -> Result<u64, Fault> {
    Ok(word::to_u64(concrete(offset, what)?).unwrap_or(u64::MAX))
}

fn bytes(cells: &[Cell]) -> Option<Vec<u8>> {
    cells.iter().map(Cell::as_concrete).collect()
}

pub struct Interpreter<'a> {
    builder: &'a mut ExprBuilder,
    settings: &'a Settings,
    watchdog: &'a dyn Watchdog,
}

impl<'a> Interpreter<'a> {
    pub fn new(builder: &'a mut ExprBuilder, settings: &'a Settings, watchdog: &'a dyn Watchdog) -> Self {
        Self {
            builder,
            settings,
            watchdog,
        }
    }

    /// Executes `state` until it branches or terminates.
    pub fn run(&mut self, mut state: ExecutionState) -> Transition {
        loop {
            if self.watchdog.should_stop() {
                return terminal(state, FindingKind::Incomplete, Cause::Cancelled);
            }

            if state.instruction_count >= self.settings.max_instructions {
                return terminal(
                    state,
                    FindingKind::BoundedAbort,
                    Cause::Bound(Bound::Instructions),
                );
            }

            let step = match state.pending_fault.take() {
                Some(fault) => Err(fault),
                None => self.step(&mut state),
            };

            let termination = match step {
                Ok(Step::Continue) => None,
                Ok(Step::Branch { guard, target }) => return self.fork(state, guard, target),
                Ok(Step::Halt(halt)) => self.halt(&mut state, halt),
                Err(fault) => self.fault(&mut state, fault),
            };

            if let Some(termination) = termination {
                return Transition::Terminal(Box::new(state), termination);
            }

            if self.watchdog.should_stop() {
                return terminal(state, FindingKind::Incomplete, Cause::Cancelled);
            }
        }
    }

    fn fork(&mut self, state: ExecutionState, guard: Word, target: Result<usize, Fault>) -> Transition {
        let negated = self.builder.iszero(&guard);
        let pc = state.pc();

        trace!("fork at {:#06x} on {}", pc, guard);

        let mut taken = state.clone();
        let mut not_taken = state;

        for (child, constraint) in [(&mut taken, guard), (&mut not_taken, negated)] {
            child.fork_depth += 1;
            if let Word::Symbolic(constraint) = constraint {
                child.path_condition = child.path_condition.with(constraint);
            }
        }

        if let Some(frame) = taken.frame_mut() {
            match target {
                Ok(target) => frame.pc = target,
                Err(fault) => taken.pending_fault = Some(fault),
            }
        }

        if let Some(frame) = not_taken.frame_mut() {
            frame.pc = pc + 1;
        }

        Transition::Branched {
            taken: Box::new(taken),
            not_taken: Box::new(not_taken),
        }
    }

    fn step(&mut self, state: &mut ExecutionState) -> Result<Step, Fault> {
        let entry_address = state.frames.first().map(|f| f.code_address);
        let call_depth = state.call_depth();
        let settings = self.settings;
        let builder = &mut *self.builder;

        let ExecutionState {
            frames,
            world,
            returndata,
            origin,
            block,
            instruction_count,
            ..
        } = state;

        let frame = frames.last_mut().ok_or(Fault::StackUnderflow)?;
        let pc = frame.pc;

        if Some(frame.code_address) == entry_address && settings.watched_addresses.contains(&pc) {
            return Ok(Step::Halt(Halt::WatchedAddress));
        }

        let program = frame.program.clone();
        let instruction = program
            .instruction(pc)
            .ok_or_else(|| Fault::UnsupportedOpcode(format!("payload byte at {:#x}", pc)))?;

        trace!("{:#06x}: {}", pc, instruction);

        *instruction_count += 1;

        let stack = &mut frame.stack;
        let mut next = pc + 1;

        match instruction {
            Instruction::Stop => return Ok(Step::Halt(Halt::Stop)),
            Instruction::Unary(op) => {
                let x = pop(stack)?;
                push(stack, builder.unary(*op, &x))?;
            }
            Instruction::Binary(op) => {
                let lhs = pop(stack)?;
                let rhs = pop(stack)?;
                push(stack, builder.binary(*op, &lhs, &rhs))?;
            }
            Instruction::Ternary(op) => {
                let a = pop(stack)?;
                let b = pop(stack)?;
                let n = pop(stack)?;
                push(stack, builder.ternary(*op, &a, &b, &n))?;
            }
            Instruction::Keccak256 => {
                let offset = pop(stack)?;
                let size = pop(stack)?;
                let (offset, size) = range(&offset, &size)?;

                frame.memory.expand(offset, size);

                let hash = match frame.memory.concrete_bytes(offset, size) {
                    Some(bytes) => Word::Concrete(keccak256(&bytes)),
                    None => {
                        let parts = frame.memory.words(offset, size, builder);
                        builder.keccak(size, &parts)
                    }
                };

                push(&mut frame.stack, hash)?;
            }
            Instruction::Environment(op) => {
                let value = match op {
                    EnvOp::Address => Word::Concrete(frame.address),
                    EnvOp::Origin => origin.clone(),
                    EnvOp::Caller => frame.caller.clone(),
                    EnvOp::CallValue => frame.value.clone(),
                    EnvOp::CallDataSize => Word::from(frame.calldata.len()),
                    EnvOp::CodeSize => Word::from(program.len() as u64),
                    EnvOp::GasPrice => Word::Concrete(block.gas_price),
                    EnvOp::ReturnDataSize => Word::from(returndata.len()),
                    EnvOp::Coinbase => Word::Concrete(block.coinbase),
                    EnvOp::Timestamp => Word::Concrete(block.timestamp),
                    EnvOp::Number => Word::Concrete(block.number),
                    EnvOp::PrevRandao => Word::Concrete(block.prevrandao),
                    EnvOp::GasLimit => Word::Concrete(block.gas_limit),
                    EnvOp::ChainId => Word::Concrete(block.chain_id),
                    EnvOp::SelfBalance => Word::Concrete(world.balance(frame.address)),
                    EnvOp::BaseFee => Word::Concrete(block.base_fee),
                    EnvOp::Pc => Word::from(pc as u64),
                    EnvOp::MSize => Word::from(frame.memory.len()),
                    // gas is not metered
                    EnvOp::Gas => Word::Concrete(block.gas_limit),
                };

                push(stack, value)?;
            }
            Instruction::Balance => {
                let address = concrete(&pop(stack)?, "balance address")?;
                push(stack, Word::Concrete(world.balance(address)))?;
            }
            Instruction::ExtCodeSize => {
                let address = concrete(&pop(stack)?, "code address")?;
                let size = world.code(address).map_or(0, |p| p.len() as u64);
                push(stack, Word::from(size))?;
            }
            Instruction::CallDataLoad => {
                let offset = source_offset(&pop(stack)?, "calldata offset")?;
                let value = frame.calldata.read_word(offset, builder);
                push(&mut frame.stack, value)?;
            }
            Instruction::CallDataCopy | Instruction::CodeCopy | Instruction::ReturnDataCopy => {
                let dest = pop(stack)?;
                let offset = source_offset(&pop(stack)?, "copy offset")?;
                let size = pop(stack)?;
                let (dest, size) = range(&dest, &size)?;

                let cells = match instruction {
                    Instruction::CallDataCopy => frame.calldata.read_range(offset, size),
                    Instruction::CodeCopy => ByteMap::from_bytes(program.bytecode()).read_range(offset, size),
                    _ => {
                        if offset.saturating_add(size) > returndata.len() {
                            return Err(Fault::ReturnDataOutOfBounds);
                        }
                        returndata.read_range(offset, size)
                    }
                };

                frame.memory.expand(dest, size);
                frame.memory.write_cells(dest, cells);
            }
            Instruction::Pop => {
                pop(stack)?;
            }
            Instruction::MLoad => {
                let offset = pop(stack)?;
                let (offset, size) = range(&offset, &Word::from(WORD_BYTES as u64))?;

                frame.memory.expand(offset, size);

                let value = frame.memory.read_word(offset, builder);
                push(&mut frame.stack, value)?;
            }
            Instruction::MStore | Instruction::MStore8 => {
                let offset = pop(stack)?;
                let value = pop(stack)?;
                let width = if *instruction == Instruction::MStore { WORD_BYTES as u64 } else { 1 };
                let (offset, size) = range(&offset, &Word::from(width))?;

                frame.memory.expand(offset, size);

                if width == 1 {
                    frame.memory.write_byte(offset, &value);
                } else {
                    frame.memory.write_word(offset, &value);
                }
            }
            Instruction::SLoad => {
                let key = pop(stack)?;
                push(stack, world.sload(frame.address, &key, builder))?;
            }
            Instruction::SStore => {
                if frame.is_static {
                    return Err(Fault::StaticViolation);
                }
                let key = pop(stack)?;
                let value = pop(stack)?;
                world.sstore(frame.address, key, value);
            }
            Instruction::Jump => {
                let target = concrete(&pop(stack)?, "jump destination")?;
                next = jump_target(frame, target)?;
            }
            Instruction::JumpI => {
                let target = concrete(&pop(stack)?, "jump destination")?;
                let guard = pop(stack)?;

                match guard {
                    Word::Concrete(c) if c == U256::ZERO => {}
                    Word::Concrete(_) => next = jump_target(frame, target)?,
                    guard => {
                        return Ok(Step::Branch {
                            guard,
                            target: jump_target(frame, target),
                        })
                    }
                }
            }
            Instruction::JumpDest => {}
            Instruction::Push { size, value } => {
                push(stack, Word::Concrete(*value))?;
                next = pc + 1 + usize::from(*size);
            }
            Instruction::Dup(n) => {
                let n = usize::from(*n);
                if stack.len() < n {
                    return Err(Fault::StackUnderflow);
                }
                let value = stack[stack.len() - n].clone();
                push(stack, value)?;
            }
            Instruction::Swap(n) => {
                let n = usize::from(*n);
                if stack.len() <= n {
                    return Err(Fault::StackUnderflow);
                }
                let top = stack.len() - 1;
                stack.swap(top, top - n);
            }
            Instruction::Log(n) => {
                if frame.is_static {
                    return Err(Fault::StaticViolation);
                }

                let offset = pop(stack)?;
                let size = pop(stack)?;
                let topics = (0..*n).map(|_| pop(stack)).collect::<Result<Vec<_>, _>>()?;
                let (offset, size) = range(&offset, &size)?;

                frame.memory.expand(offset, size);

                let watched = topics
                    .first()
                    .and_then(Word::as_concrete)
                    .map_or(false, |t| settings.watched_topics.contains(&t));

                if watched {
                    return Ok(Step::Halt(Halt::Event(topics)));
                }
            }
            Instruction::Call(kind) => {
                let kind = *kind;
                let _gas = pop(stack)?;
                let target = concrete(&pop(stack)?, "call target")?;
                let value = if kind.has_value() { pop(stack)? } else { Word::zero() };
                let args_offset = pop(stack)?;
                let args_size = pop(stack)?;
                let ret_offset = pop(stack)?;
                let ret_size = pop(stack)?;

                let (args_offset, args_size) = range(&args_offset, &args_size)?;
                let (ret_offset, ret_size) = range(&ret_offset, &ret_size)?;

                if frame.is_static && kind == CallKind::Call && value.as_concrete() != Some(U256::ZERO) {
                    return Err(Fault::StaticViolation);
                }

                frame.memory.expand(args_offset, args_size);
                frame.memory.expand(ret_offset, ret_size);
                frame.pc = next;

                let program = match world.code(target) {
                    Some(program) => program,
                    None => {
                        trace!("call to account {:#x} without code", target);
                        *returndata = ByteMap::new();
                        push(&mut frame.stack, Word::one())?;
                        return Ok(Step::Continue);
                    }
                };

                if call_depth + 1 > settings.max_call_depth {
                    frame.pc = pc;
                    return Err(Fault::BoundExceeded(Bound::CallDepth));
                }

                let calldata = ByteMap::from_cells(frame.memory.read_range(args_offset, args_size));
                let (address, caller, value, is_static) = match kind {
                    CallKind::Call => (target, Word::Concrete(frame.address), value, frame.is_static),
                    CallKind::CallCode => (frame.address, Word::Concrete(frame.address), value, frame.is_static),
                    CallKind::DelegateCall => (frame.address, frame.caller.clone(), frame.value.clone(), frame.is_static),
                    CallKind::StaticCall => (target, Word::Concrete(frame.address), Word::zero(), true),
                };

                trace!("{} into {:#x} at depth {}", kind, target, call_depth + 1);

                let callee = Frame {
                    address,
                    code_address: target,
                    program,
                    pc: 0,
                    stack: Vec::new(),
                    memory: ByteMap::new(),
                    calldata,
                    caller,
                    value,
                    is_static,
                    return_target: ReturnTarget {
                        offset: ret_offset,
                        size: ret_size,
                    },
                    world_snapshot: world.clone(),
                };

                frames.push(callee);

                return Ok(Step::Continue);
            }
            Instruction::Return | Instruction::Revert => {
                let offset = pop(stack)?;
                let size = pop(stack)?;
                let (offset, size) = range(&offset, &size)?;

                frame.memory.expand(offset, size);

                let data = frame.memory.read_range(offset, size);

                return Ok(Step::Halt(if *instruction == Instruction::Return {
                    Halt::Return(data)
                } else {
                    Halt::Revert(data)
                }));
            }
            Instruction::Invalid => return Ok(Step::Halt(Halt::Invalid)),
            Instruction::SelfDestruct => {
                if frame.is_static {
                    return Err(Fault::StaticViolation);
                }
                let beneficiary = pop(stack)?;
                return Ok(Step::Halt(Halt::SelfDestruct(beneficiary)));
            }
            Instruction::NotImplemented(byte) | Instruction::Unknown(byte) => {
                let name = mnemonic(*byte).unwrap_or_else(|| format!("{:#04x}", byte));
                return Err(Fault::UnsupportedOpcode(name));
            }
        }

        frame.pc = next;

        Ok(Step::Continue)
    }

    fn halt(&mut self, state: &mut ExecutionState, halt: Halt) -> Option<Termination> {
        let nested = state.call_depth() > 0;

        match halt {
            Halt::Event(topics) => Some(Termination::new(
                FindingKind::FlaggedEventReached,
                Cause::Event { topics },
            )),
            Halt::WatchedAddress => Some(Termination::new(
                FindingKind::FlaggedEventReached,
                Cause::WatchedAddress,
            )),
            Halt::Invalid => Some(Termination::new(
                FindingKind::InvariantViolated,
                Cause::InvalidOpcode,
            )),
            Halt::SelfDestruct(beneficiary) if self.settings.selfdestruct_is_violation => {
                Some(Termination::new(
                    FindingKind::InvariantViolated,
                    Cause::SelfDestruct { beneficiary },
                ))
            }
            Halt::Stop | Halt::SelfDestruct(_) if !nested => {
                Some(Termination::new(FindingKind::NormalReturn, Cause::Stop))
            }
            Halt::Stop | Halt::SelfDestruct(_) => {
                self.leave_frame(state, true, Vec::new());
                None
            }
            Halt::Return(data) if !nested => Some(Termination::new(
                FindingKind::NormalReturn,
                Cause::Return { data: bytes(&data) },
            )),
            Halt::Return(data) => {
                self.leave_frame(state, true, data);
                None
            }
            Halt::Revert(data) => {
                if let Some(code) = self.panic_code(&data) {
                    return Some(Termination::new(
                        FindingKind::InvariantViolated,
                        Cause::Panic { code },
                    ));
                }

                if nested {
                    self.leave_frame(state, false, data);
                    None
                } else {
                    Some(Termination::new(
                        FindingKind::Reverted,
                        Cause::Revert { data: bytes(&data) },
                    ))
                }
            }
        }
    }

    fn panic_code(&mut self, data: &[Cell]) -> Option<Word> {
        if data.len() < 4 + WORD_BYTES || bytes(&data[..4])? != PANIC_SELECTOR {
            return None;
        }

        Some(assemble_word(&data[4..4 + WORD_BYTES], self.builder))
    }

    fn fault(&mut self, state: &mut ExecutionState, fault: Fault) -> Option<Termination> {
        match fault {
            Fault::UnsupportedOpcode(_) | Fault::SymbolicOperand(_) => {
                warn!("unsupported at {:#06x}: {}", state.pc(), fault);
                Some(Termination::new(FindingKind::Unsupported, Cause::Unsupported(fault)))
            }
            Fault::BoundExceeded(bound) => Some(Termination::new(
                FindingKind::BoundedAbort,
                Cause::Bound(bound),
            )),
            Fault::MemoryLimit(_) => Some(Termination::new(
                FindingKind::BoundedAbort,
                Cause::Bound(Bound::Memory),
            )),
            fault if state.call_depth() > 0 => {
                trace!("exceptional halt in nested frame: {}", fault);
                self.leave_frame(state, false, Vec::new());
                None
            }
            fault => Some(Termination::new(
                FindingKind::Reverted,
                Cause::Exceptional(fault),
            )),
        }
    }

    /// Returns from the innermost frame to its caller.
    fn leave_frame(&mut self, state: &mut ExecutionState, success: bool, data: Vec<Cell>) {
        let callee = match state.frames.pop() {
            Some(callee) => callee,
            None => return,
        };

        if !success {
            state.world = callee.world_snapshot;
        }

        let target = callee.return_target;
        let copied = data
            .iter()
            .take(target.size as usize)
            .cloned()
            .collect::<Vec<_>>();

        state.returndata = ByteMap::from_cells(data);

        if let Some(caller) = state.frames.last_mut() {
            caller.memory.write_cells(target.offset, copied);
            // the caller has just popped the call operands
            caller.stack.push(Word::from_bool(success));
        }
    }
}

fn jump_target(frame: &Frame, target: U256) -> Result<usize, Fault> {
    match word::to_usize(target) {
        Some(t) if frame.program.is_jumpdest(t) => Ok(t),
        _ => Err(Fault::InvalidJump(target)),
    }
}

fn terminal(state: ExecutionState, kind: FindingKind, cause: Cause) -> Transition {
    Transition::Terminal(Box::new(state), Termination::new(kind, cause))
}
