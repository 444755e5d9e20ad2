mod coverage_guided;
mod depth_first;

pub use self::{coverage_guided::*, depth_first::*};

use crate::engine::{options::Strategy, state::ExecutionState};

/// Ordering discipline of the frontier of pending execution states.
pub trait ExplorationStrategy: Send {
    fn push(&mut self, state: ExecutionState);

    /// Takes the state to explore next.
    fn pop(&mut self) -> Option<ExecutionState>;

    /// Removes the state least likely to be explored soon, used when the
    /// frontier is full.
    fn evict(&mut self) -> Option<ExecutionState>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called with every state taken from the frontier.
    fn record_visit(&mut self, _state: &ExecutionState) {}
}

pub fn create_strategy(strategy: Strategy) -> Box<dyn ExplorationStrategy> {
    match strategy {
        Strategy::DepthFirst => Box::new(DepthFirstStrategy::new()),
        Strategy::CoverageGuided => Box::new(CoverageGuidedStrategy::new()),
    }
}
