//! Path scheduling. The explorer owns the frontier, asks the solver about
//! every forked state before admitting it, enforces the exploration bounds and
//! hands out findings lazily.

use super::{
    finding::{Bound, Cause, Finding, FindingKind, Witness},
    interpreter::{Interpreter, Settings, Termination, Transition},
    memory::WorldState,
    options::ExplorationOptions,
    state::{Argument, Entry, ExecutionState},
    watchdog::{LazyWatchdog, Watchdog},
};
use crate::{
    disassemble::DisassemblyError,
    expr::{Expr, ExprBuilder, Model},
    path_exploration::{create_strategy, ExplorationStrategy},
    solver::{NativeSolver, SatResult, Solver, SolverError, UnknownReason},
    word::U256,
};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
};
use strum::{Display, IntoStaticStr};
use thiserror::Error;

/// The only errors that abort a whole run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExplorationError {
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(#[from] DisassemblyError),

    #[error("{0}")]
    SolverUnavailable(#[from] SolverError),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

/// Why a run did not cover the whole bounded state space.
#[derive(Clone, Copy, Debug, Display, IntoStaticStr, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum IncompleteReason {
    BoundedAbort,
    Unsupported,
    StateLimit,
    Cancelled,
    /// The finding stream has not been consumed to its end.
    Unfinished,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Incomplete(BTreeSet<IncompleteReason>),
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Complete)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Incomplete(reasons) => {
                write!(f, "incomplete (")?;
                for (i, reason) in reasons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", reason)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub states_explored: usize,
    pub forks: usize,
    pub infeasible: usize,
    pub evictions: usize,
    pub solver_calls: usize,
    pub unconfirmed: usize,
    pub findings: usize,
}

static LAZY: LazyWatchdog = LazyWatchdog;

/// A single exploration. Iterating yields every finding exactly once; the
/// stream is finite and can not be restarted.
pub struct Explorer<'a> {
    builder: ExprBuilder,
    settings: Settings,
    options: ExplorationOptions,
    solver: &'a dyn Solver,
    watchdog: &'a dyn Watchdog,
    frontier: Box<dyn ExplorationStrategy>,
    inputs: Vec<String>,
    pending: VecDeque<Finding>,
    reasons: BTreeSet<IncompleteReason>,
    stats: Stats,
    finished: bool,
}

impl<'a> Explorer<'a> {
    pub fn new(
        world: &WorldState,
        entry: &Entry,
        options: &ExplorationOptions,
        solver: &'a dyn Solver,
    ) -> Result<Self, ExplorationError> {
        solver.ensure_available()?;

        // the initial state alone occupies one frontier slot
        if options.max_frontier == 0 {
            return Err(ExplorationError::InvalidOptions(
                "max_frontier must be at least 1".to_string(),
            ));
        }

        let mut builder = ExprBuilder::new();
        let initial = ExecutionState::initial(world, entry, &mut builder)?;
        let mut frontier = create_strategy(options.strategy);

        frontier.push(initial);

        let inputs = entry
            .arguments
            .iter()
            .chain([&entry.caller, &entry.value])
            .filter_map(|a| match a {
                Argument::Symbolic(name) => Some(name.clone()),
                Argument::Concrete(_) => None,
            })
            .collect();

        debug!(
            "exploring {:#x} with {} strategy and {} solver",
            entry.address,
            options.strategy,
            solver.name()
        );

        Ok(Self {
            builder,
            settings: Settings::from(options),
            options: options.clone(),
            solver,
            watchdog: &LAZY,
            frontier,
            inputs,
            pending: VecDeque::new(),
            reasons: BTreeSet::new(),
            stats: Stats::default(),
            finished: false,
        })
    }

    /// Polls `watchdog` for cooperative cancellation.
    pub fn with_watchdog(mut self, watchdog: &'a dyn Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Only meaningful once the iterator is exhausted; before that the run
    /// counts as unfinished.
    pub fn status(&self) -> RunStatus {
        let mut reasons = self.reasons.clone();

        if !self.finished || !self.pending.is_empty() {
            reasons.insert(IncompleteReason::Unfinished);
        }

        if reasons.is_empty() {
            RunStatus::Complete
        } else {
            RunStatus::Incomplete(reasons)
        }
    }

    /// Consumes the remaining findings.
    pub fn run(&mut self) -> Vec<Finding> {
        let findings = time_info!("exploration finished", { self.by_ref().collect::<Vec<_>>() });

        info!(
            "{} findings, {} states, {} forks, {} infeasible, {} solver calls: {}",
            self.stats.findings,
            self.stats.states_explored,
            self.stats.forks,
            self.stats.infeasible,
            self.stats.solver_calls,
            self.status()
        );

        findings
    }

    fn advance(&mut self) {
        if self.frontier.is_empty() {
            self.finished = true;
            return;
        }

        if self.watchdog.should_stop() {
            warn!("exploration cancelled with {} pending states", self.frontier.len());
            self.drain(IncompleteReason::Cancelled, Cause::Cancelled);
            return;
        }

        if self.stats.states_explored >= self.options.max_states {
            warn!(
                "state bound of {} reached with {} pending states",
                self.options.max_states,
                self.frontier.len()
            );
            self.drain(IncompleteReason::StateLimit, Cause::Bound(Bound::States));
            return;
        }

        let state = match self.frontier.pop() {
            Some(state) => state,
            None => return,
        };

        self.frontier.record_visit(&state);
        self.stats.states_explored += 1;

        let transition = Interpreter::new(&mut self.builder, &self.settings, self.watchdog).run(state);

        match transition {
            Transition::Terminal(state, termination) => self.terminate(*state, termination, None),
            Transition::Branched { taken, not_taken } => {
                self.stats.forks += 1;
                // the taken side is explored first
                self.admit(*not_taken);
                self.admit(*taken);
            }
        }
    }

    /// Turns every pending state into an incomplete finding.
    fn drain(&mut self, reason: IncompleteReason, cause: Cause) {
        self.reasons.insert(reason);

        while let Some(state) = self.frontier.pop() {
            let finding = self.finding(&state, Termination::new(FindingKind::Incomplete, cause.clone()), None, false);
            self.emit(finding);
        }

        self.finished = true;
    }

    fn admit(&mut self, mut state: ExecutionState) {
        let constraints = state.path_condition.to_vec();

        let model = match self.check(&constraints) {
            SatResult::Unsat => {
                debug!("dropping infeasible state at {:#x}", state.pc());
                self.stats.infeasible += 1;
                return;
            }
            SatResult::Unknown(UnknownReason::Cancelled) => {
                let termination = Termination::new(FindingKind::Incomplete, Cause::Cancelled);
                self.reasons.insert(IncompleteReason::Cancelled);
                let finding = self.finding(&state, termination, None, false);
                self.emit(finding);
                return;
            }
            SatResult::Unknown(reason) => {
                warn!("admitting unconfirmed state at {:#x}: solver {}", state.pc(), reason);
                if !state.unconfirmed {
                    self.stats.unconfirmed += 1;
                }
                state.unconfirmed = true;
                None
            }
            SatResult::Sat(model) => Some(model),
        };

        if state.fork_depth > self.options.max_fork_depth {
            let termination = Termination::new(FindingKind::BoundedAbort, Cause::Bound(Bound::ForkDepth));
            self.terminate(state, termination, model);
            return;
        }

        if self.frontier.len() >= self.options.max_frontier {
            // with nothing to evict the incoming state itself is dropped
            let (evicted, incoming) = match self.frontier.evict() {
                Some(evicted) => (evicted, Some(state)),
                None => (state, None),
            };

            warn!("frontier full, evicting state at {:#x}", evicted.pc());
            self.stats.evictions += 1;

            let termination = Termination::new(FindingKind::BoundedAbort, Cause::Bound(Bound::Frontier));
            self.terminate(evicted, termination, None);

            if let Some(state) = incoming {
                self.frontier.push(state);
            }
            return;
        }

        trace!("admitting state at {:#x}", state.pc());
        self.frontier.push(state);
    }

    fn check(&mut self, constraints: &[Expr]) -> SatResult {
        self.stats.solver_calls += 1;

        match self.solver.check(constraints, self.watchdog) {
            Ok(result) => result,
            Err(err) => {
                warn!("solver failed: {}", err);
                SatResult::Unknown(UnknownReason::Unsupported)
            }
        }
    }

    fn terminate(&mut self, state: ExecutionState, termination: Termination, model: Option<Model>) {
        let constraints = state.path_condition.to_vec();

        let result = match model {
            Some(model) => SatResult::Sat(model),
            None => self.check(&constraints),
        };

        let (model, confirmed) = match result {
            SatResult::Sat(model) => (Some(model), !state.unconfirmed),
            SatResult::Unsat => {
                debug!("dropping infeasible terminal state at {:#x}", state.pc());
                self.stats.infeasible += 1;
                return;
            }
            SatResult::Unknown(_) => (None, false),
        };

        match termination.kind {
            FindingKind::BoundedAbort => {
                self.reasons.insert(IncompleteReason::BoundedAbort);
            }
            FindingKind::Unsupported => {
                self.reasons.insert(IncompleteReason::Unsupported);
            }
            FindingKind::Incomplete => {
                self.reasons.insert(IncompleteReason::Cancelled);
            }
            _ => {}
        }

        let finding = self.finding(&state, termination, model, confirmed);

        self.emit(finding);
    }

    fn finding(
        &self,
        state: &ExecutionState,
        termination: Termination,
        model: Option<Model>,
        solver_confirmed: bool,
    ) -> Finding {
        let witness = model.map(|mut model| {
            for input in &self.inputs {
                model.entry(input.clone()).or_insert(U256::ZERO);
            }
            Witness::from(model)
        });

        Finding {
            kind: termination.kind,
            cause: termination.cause,
            pc: state.pc(),
            address: state.address(),
            call_depth: state.call_depth(),
            instruction_count: state.instruction_count,
            fork_depth: state.fork_depth,
            path_condition: state.path_condition.to_vec(),
            witness,
            solver_confirmed,
        }
    }

    fn emit(&mut self, finding: Finding) {
        debug!("{} at {:#x}: {}", finding.kind, finding.pc, finding.cause);

        self.stats.findings += 1;
        self.pending.push_back(finding);
    }
}

impl<'a> Iterator for Explorer<'a> {
    type Item = Finding;

    fn next(&mut self) -> Option<Finding> {
        loop {
            if let Some(finding) = self.pending.pop_front() {
                return Some(finding);
            }

            if self.finished {
                return None;
            }

            self.advance();
        }
    }
}

/// Re-executes `entry` with every symbolic input replaced by its value in
/// `witness` and returns the kind of the terminal reached.
pub fn replay(
    world: &WorldState,
    entry: &Entry,
    witness: &Witness,
    options: &ExplorationOptions,
) -> Result<FindingKind, ExplorationError> {
    let solver = NativeSolver::new();
    let concrete = entry.concretize(witness);
    let mut explorer = Explorer::new(world, &concrete, options, &solver)?;

    let kind = explorer.next().map_or(FindingKind::Incomplete, |f| f.kind);

    if explorer.next().is_some() {
        warn!("concrete replay produced more than one terminal");
    }

    Ok(kind)
}
