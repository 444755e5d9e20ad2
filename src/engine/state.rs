//! Execution states, call frames and the description of where an
//! exploration starts.

use super::{
    explorer::ExplorationError,
    finding::Witness,
    interpreter::Fault,
    memory::{cells_of, ByteMap, Cell, WorldState},
};
use crate::{
    disassemble::Program,
    expr::{Expr, ExprBuilder},
    word::{Word, U256},
};
use std::{fmt, sync::Arc};

/// Name of the symbolic input standing for the caller address.
pub const CALLER_INPUT: &str = "caller";
/// Name of the symbolic input standing for the call value.
pub const CALLVALUE_INPUT: &str = "callvalue";

pub fn argument_name(index: usize) -> String {
    format!("arg{}", index)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockEnvironment {
    pub coinbase: U256,
    pub timestamp: U256,
    pub number: U256,
    pub prevrandao: U256,
    pub gas_limit: U256,
    pub chain_id: U256,
    pub base_fee: U256,
    pub gas_price: U256,
}

impl Default for BlockEnvironment {
    fn default() -> Self {
        Self {
            coinbase: U256::ZERO,
            timestamp: U256::from(1_700_000_000_u64),
            number: U256::from(18_000_000_u64),
            prevrandao: U256::ZERO,
            gas_limit: U256::from(30_000_000_u64),
            chain_id: U256::ONE,
            base_fee: U256::ZERO,
            gas_price: U256::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Argument {
    Symbolic(String),
    Concrete(U256),
}

impl Argument {
    fn word(&self, builder: &mut ExprBuilder) -> Word {
        match self {
            Argument::Symbolic(name) => Word::from(builder.input(name)),
            Argument::Concrete(c) => Word::Concrete(*c),
        }
    }

    fn concretize(&self, witness: &Witness) -> Argument {
        match self {
            Argument::Symbolic(name) => Argument::Concrete(witness.get(name).unwrap_or(U256::ZERO)),
            concrete => concrete.clone(),
        }
    }
}

/// Where and how an exploration enters the code under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub address: U256,
    /// Four byte function selector prepended to the arguments.
    pub selector: Option<[u8; 4]>,
    /// 32-byte ABI words following the selector.
    pub arguments: Vec<Argument>,
    pub caller: Argument,
    pub value: Argument,
    pub origin: U256,
    /// Offset at which execution starts.
    pub pc: usize,
    pub block: BlockEnvironment,
}

pub mod defaults {
    use crate::word::U256;

    pub const CONTRACT_ADDRESS: U256 = U256::from_words(0, 0xc0de_0000);
    pub const CALLER_ADDRESS: U256 = U256::from_words(0, 0xca11_e400);
}

impl Entry {
    pub fn new(address: U256, selector: Option<[u8; 4]>) -> Self {
        Self {
            address,
            selector,
            arguments: Vec::new(),
            caller: Argument::Concrete(defaults::CALLER_ADDRESS),
            value: Argument::Concrete(U256::ZERO),
            origin: defaults::CALLER_ADDRESS,
            pc: 0,
            block: BlockEnvironment::default(),
        }
    }

    /// Appends `count` fresh symbolic arguments named `arg<i>`.
    pub fn with_symbolic_arguments(mut self, count: usize) -> Self {
        let start = self.arguments.len();

        self.arguments
            .extend((start..start + count).map(|i| Argument::Symbolic(argument_name(i))));
        self
    }

    pub fn with_argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_symbolic_caller(mut self) -> Self {
        self.caller = Argument::Symbolic(CALLER_INPUT.to_string());
        self
    }

    pub fn with_symbolic_value(mut self) -> Self {
        self.value = Argument::Symbolic(CALLVALUE_INPUT.to_string());
        self
    }

    /// The same entry with every symbolic input replaced by its witness
    /// value. Inputs without a value become zero.
    pub fn concretize(&self, witness: &Witness) -> Entry {
        Entry {
            arguments: self.arguments.iter().map(|a| a.concretize(witness)).collect(),
            caller: self.caller.concretize(witness),
            value: self.value.concretize(witness),
            ..self.clone()
        }
    }

    fn calldata(&self, builder: &mut ExprBuilder) -> ByteMap {
        let mut cells = self
            .selector
            .iter()
            .flatten()
            .map(|b| Cell::Concrete(*b))
            .collect::<Vec<_>>();

        for argument in &self.arguments {
            cells.extend(cells_of(&argument.word(builder)));
        }

        ByteMap::from_cells(cells)
    }
}

/// Conjunction of branch guards as a persistent list, shared between all
/// states forked from a common ancestor.
#[derive(Clone, Debug, Default)]
pub struct PathCondition {
    head: Option<Arc<Link>>,
}

#[derive(Debug)]
struct Link {
    constraint: Expr,
    next: Option<Arc<Link>>,
    len: usize,
}

impl PathCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |l| l.len)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn with(&self, constraint: Expr) -> Self {
        Self {
            head: Some(Arc::new(Link {
                constraint,
                next: self.head.clone(),
                len: self.len() + 1,
            })),
        }
    }

    /// Constraints in the order they were added.
    pub fn to_vec(&self) -> Vec<Expr> {
        let mut constraints = Vec::with_capacity(self.len());
        let mut link = self.head.as_ref();

        while let Some(l) = link {
            constraints.push(l.constraint.clone());
            link = l.next.as_ref();
        }

        constraints.reverse();
        constraints
    }
}

impl fmt::Display for PathCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let constraints = self.to_vec();

        if constraints.is_empty() {
            return write!(f, "true");
        }

        constraints
            .iter()
            .enumerate()
            .try_for_each(|(i, c)| if i == 0 { write!(f, "{}", c) } else { write!(f, " && {}", c) })
    }
}

/// Location in the caller's memory receiving the output of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReturnTarget {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct Frame {
    /// Account whose storage and balance this frame operates on.
    pub address: U256,
    /// Account whose code is executed.
    pub code_address: U256,
    pub program: Arc<Program>,
    pub pc: usize,
    pub stack: Vec<Word>,
    pub memory: ByteMap,
    pub calldata: ByteMap,
    pub caller: Word,
    pub value: Word,
    pub is_static: bool,
    pub return_target: ReturnTarget,
    /// World state before the call, restored if the frame reverts.
    pub world_snapshot: WorldState,
}

/// The unit of exploration.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub frames: Vec<Frame>,
    pub world: WorldState,
    pub path_condition: PathCondition,
    pub returndata: ByteMap,
    pub origin: Word,
    pub block: Arc<BlockEnvironment>,
    pub instruction_count: u64,
    pub fork_depth: usize,
    /// Set once a solver query along this path came back unknown.
    pub unconfirmed: bool,
    /// Raised by the next step, e.g. a branch into an invalid jump target.
    pub pending_fault: Option<Fault>,
}

impl ExecutionState {
    /// Builds the state at the entry point, with the constraints implied by
    /// the entry already on the path condition.
    pub fn initial(
        world: &WorldState,
        entry: &Entry,
        builder: &mut ExprBuilder,
    ) -> Result<Self, ExplorationError> {
        let program = world.code(entry.address).ok_or_else(|| {
            ExplorationError::InvalidEntry(format!("no code at address {:#x}", entry.address))
        })?;

        if program.instruction(entry.pc).is_none() || entry.pc >= program.len() {
            return Err(ExplorationError::InvalidEntry(format!(
                "offset {:#x} is not the start of an instruction",
                entry.pc
            )));
        }

        let mut path_condition = PathCondition::new();
        let caller = entry.caller.word(builder);

        if let Word::Symbolic(_) = caller {
            // addresses are 160 bits wide
            let limit = Word::Concrete(U256::ONE << 160_u32);

            if let Word::Symbolic(range) = builder.lt(&caller, &limit) {
                path_condition = path_condition.with(range);
            }
        }

        let frame = Frame {
            address: entry.address,
            code_address: entry.address,
            program,
            pc: entry.pc,
            stack: Vec::new(),
            memory: ByteMap::new(),
            calldata: entry.calldata(builder),
            caller,
            value: entry.value.word(builder),
            is_static: false,
            return_target: ReturnTarget { offset: 0, size: 0 },
            world_snapshot: world.clone(),
        };

        Ok(Self {
            frames: vec![frame],
            world: world.clone(),
            path_condition,
            returndata: ByteMap::new(),
            origin: Word::Concrete(entry.origin),
            block: Arc::new(entry.block.clone()),
            instruction_count: 0,
            fork_depth: 0,
            unconfirmed: false,
            pending_fault: None,
        })
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Number of nested frames below the entry frame.
    pub fn call_depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn pc(&self) -> usize {
        self.frame().map_or(0, |f| f.pc)
    }

    pub fn address(&self) -> U256 {
        self.frame().map_or(U256::ZERO, |f| f.code_address)
    }
}
