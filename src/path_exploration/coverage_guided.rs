use super::ExplorationStrategy;
use crate::{engine::state::ExecutionState, word::U256};
use log::trace;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
};

type Priority = (u64, Reverse<u64>);

/// Prefers states whose program counter was visited least often. Ties go to
/// the most recently pushed state, so a fresh program behaves depth-first.
#[derive(Debug, Default)]
pub struct CoverageGuidedStrategy {
    visits: HashMap<(U256, usize), u64>,
    queue: BTreeMap<Priority, ExecutionState>,
    sequence: u64,
}

impl CoverageGuidedStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn visits_of(&self, state: &ExecutionState) -> u64 {
        self.visits
            .get(&(state.address(), state.pc()))
            .copied()
            .unwrap_or(0)
    }
}

impl ExplorationStrategy for CoverageGuidedStrategy {
    fn push(&mut self, state: ExecutionState) {
        let priority = (self.visits_of(&state), Reverse(self.sequence));

        self.sequence += 1;
        self.queue.insert(priority, state);
    }

    fn pop(&mut self) -> Option<ExecutionState> {
        let key = *self.queue.keys().next()?;
        let state = self.queue.remove(&key)?;

        trace!("picked state at {:#x} with {} prior visits", state.pc(), key.0);

        Some(state)
    }

    fn evict(&mut self) -> Option<ExecutionState> {
        let key = *self.queue.keys().next_back()?;

        self.queue.remove(&key)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn record_visit(&mut self, state: &ExecutionState) {
        *self.visits.entry((state.address(), state.pc())).or_insert(0) += 1;
    }
}
