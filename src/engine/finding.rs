use super::interpreter::Fault;
use crate::{
    expr::{Expr, Model},
    util::format_u256,
    word::{Word, U256},
};
use serde::Serialize;
use std::{collections::BTreeMap, fmt};
use strum::{Display, IntoStaticStr};

/// Selector of `Panic(uint256)`, raised by compiler-inserted assertions.
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

#[derive(Clone, Copy, Debug, Display, IntoStaticStr, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    Reverted,
    NormalReturn,
    FlaggedEventReached,
    InvariantViolated,
    BoundedAbort,
    Unsupported,
    Incomplete,
}

impl FindingKind {
    /// Findings that leave part of the state space unexplored.
    pub fn is_incomplete(self) -> bool {
        matches!(
            self,
            FindingKind::BoundedAbort | FindingKind::Unsupported | FindingKind::Incomplete
        )
    }
}

/// The resource bound that stopped a path or the run.
#[derive(Clone, Copy, Debug, Display, IntoStaticStr, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Bound {
    Instructions,
    ForkDepth,
    CallDepth,
    Frontier,
    States,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cause {
    Stop,
    Return { data: Option<Vec<u8>> },
    Revert { data: Option<Vec<u8>> },
    /// Exceptional halt of the entry frame, e.g. an invalid jump.
    Exceptional(Fault),
    Event { topics: Vec<Word> },
    WatchedAddress,
    Panic { code: Word },
    InvalidOpcode,
    SelfDestruct { beneficiary: Word },
    Bound(Bound),
    Unsupported(Fault),
    Cancelled,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn data(f: &mut fmt::Formatter, data: &Option<Vec<u8>>) -> fmt::Result {
            match data {
                Some(d) if d.is_empty() => Ok(()),
                Some(d) => write!(f, " 0x{}", hex::encode(d)),
                None => write!(f, " <symbolic data>"),
            }
        }

        match self {
            Cause::Stop => write!(f, "stop"),
            Cause::Return { data: d } => write!(f, "return").and_then(|_| data(f, d)),
            Cause::Revert { data: d } => write!(f, "revert").and_then(|_| data(f, d)),
            Cause::Exceptional(fault) => write!(f, "exceptional halt: {}", fault),
            Cause::Event { topics } => {
                write!(f, "event")?;
                topics.iter().try_for_each(|t| write!(f, " {}", t))
            }
            Cause::WatchedAddress => write!(f, "watched address reached"),
            Cause::Panic { code } => write!(f, "panic {}", code),
            Cause::InvalidOpcode => write!(f, "invalid opcode"),
            Cause::SelfDestruct { beneficiary } => write!(f, "selfdestruct to {}", beneficiary),
            Cause::Bound(bound) => write!(f, "{} bound exceeded", bound),
            Cause::Unsupported(fault) => write!(f, "{}", fault),
            Cause::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Concrete assignment to the symbolic inputs of a path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Witness(BTreeMap<String, U256Literal>);

/// A word serialized as an exact `0x` literal of full width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct U256Literal(pub U256);

impl Serialize for U256Literal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_u256(self.0))
    }
}

impl Witness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, input: &str) -> Option<U256> {
        self.0.get(input).map(|v| v.0)
    }

    pub fn insert(&mut self, input: &str, value: U256) {
        self.0.insert(input.to_string(), U256Literal(value));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, U256)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.0))
    }

    pub fn to_model(&self) -> Model {
        self.iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

impl From<Model> for Witness {
    fn from(model: Model) -> Self {
        Self(model.into_iter().map(|(k, v)| (k, U256Literal(v))).collect())
    }
}

impl fmt::Display for Witness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[").and_then(|_| {
            self.iter()
                .try_for_each(|(input, value)| writeln!(f, "  {} := {} ({}),", input, format_u256(value), value))
                .and_then(|_| write!(f, "]"))
        })
    }
}

/// Outcome of one explored path.
#[derive(Clone, Debug)]
pub struct Finding {
    pub kind: FindingKind,
    pub cause: Cause,
    /// Program counter of the terminating instruction in `address`.
    pub pc: usize,
    pub address: U256,
    pub call_depth: usize,
    pub instruction_count: u64,
    pub fork_depth: usize,
    /// Conjunction of branch guards, each of which holds if non-zero.
    pub path_condition: Vec<Expr>,
    pub witness: Option<Witness>,
    /// `false` if the solver could not decide some query along the path.
    pub solver_confirmed: bool,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "kind: {}", self.kind)?;
        writeln!(f, "cause: {}", self.cause)?;
        writeln!(f, "pc: {:#x} (contract {})", self.pc, format_u256(self.address))?;
        writeln!(
            f,
            "depth: {} calls, {} forks, {} instructions",
            self.call_depth, self.fork_depth, self.instruction_count
        )?;
        writeln!(f, "path condition:")?;
        for constraint in &self.path_condition {
            writeln!(f, "  {}", constraint)?;
        }
        match &self.witness {
            Some(witness) => write!(f, "witness: {}", witness)?,
            None => write!(f, "witness: none")?,
        }
        if !self.solver_confirmed {
            write!(f, "\n(solver-unconfirmed)")?;
        }
        Ok(())
    }
}
