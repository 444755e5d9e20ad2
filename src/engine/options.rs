use crate::{expr::keccak256, util::parse_u256, word::U256};
use serde::Deserialize;
use strum::{Display, EnumString, EnumVariantNames, IntoStaticStr};

pub mod defaults {
    pub const MAX_CALL_DEPTH: usize = 8;
    pub const MAX_FORK_DEPTH: usize = 64;
    pub const MAX_INSTRUCTIONS: u64 = 10_000;
    pub const MAX_FRONTIER: usize = 1024;
    pub const MAX_STATES: usize = 10_000;
    pub const SOLVER_TIMEOUT_MS: u64 = 3_000;
}

/// Order in which pending states are taken from the frontier.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, EnumVariantNames, IntoStaticStr, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    /// Last forked state first.
    #[default]
    DepthFirst,
    /// State whose program counter was visited least often first.
    CoverageGuided,
}

/// Bounds and watch-list of a single exploration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorationOptions {
    /// Maximum number of nested call frames.
    #[serde(alias = "max_depth")]
    pub max_call_depth: usize,
    /// Maximum number of symbolic branches along one path.
    pub max_fork_depth: usize,
    /// Maximum number of instructions executed along one path.
    pub max_instructions: u64,
    /// Maximum number of pending states.
    pub max_frontier: usize,
    /// Number of explored states after which the whole run stops.
    pub max_states: usize,
    pub strategy: Strategy,
    /// Event signatures like `Bug(uint256)`, or raw `0x` topic hashes.
    pub watch_events: Vec<String>,
    /// Program counters of the entry contract that end a path when reached.
    pub watch_addresses: Vec<usize>,
    pub solver_timeout_ms: u64,
    pub selfdestruct_is_violation: bool,
}

impl Default for ExplorationOptions {
    fn default() -> Self {
        Self {
            max_call_depth: defaults::MAX_CALL_DEPTH,
            max_fork_depth: defaults::MAX_FORK_DEPTH,
            max_instructions: defaults::MAX_INSTRUCTIONS,
            max_frontier: defaults::MAX_FRONTIER,
            max_states: defaults::MAX_STATES,
            strategy: Strategy::default(),
            watch_events: Vec::new(),
            watch_addresses: Vec::new(),
            solver_timeout_ms: defaults::SOLVER_TIMEOUT_MS,
            selfdestruct_is_violation: false,
        }
    }
}

impl ExplorationOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Topics (`LOG` topic 0) that flag a path.
    pub fn watched_topics(&self) -> Vec<U256> {
        self.watch_events.iter().map(|e| event_topic(e)).collect()
    }
}

/// Topic of an event, given as signature or as literal hash.
pub fn event_topic(event: &str) -> U256 {
    let event = event.trim();

    match event.strip_prefix("0x").and_then(|_| parse_u256(event)) {
        Some(topic) => topic,
        None => keccak256(event.replace(' ', "").as_bytes()),
    }
}
