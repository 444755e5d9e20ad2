use super::ExplorationStrategy;
use crate::engine::state::ExecutionState;
use std::collections::VecDeque;

/// Last pushed state first. Evicts the oldest state.
#[derive(Debug, Default)]
pub struct DepthFirstStrategy {
    states: VecDeque<ExecutionState>,
}

impl DepthFirstStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExplorationStrategy for DepthFirstStrategy {
    fn push(&mut self, state: ExecutionState) {
        self.states.push_back(state);
    }

    fn pop(&mut self) -> Option<ExecutionState> {
        self.states.pop_back()
    }

    fn evict(&mut self) -> Option<ExecutionState> {
        self.states.pop_front()
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}
