//! Deterministic in-process solver.
//!
//! Constraints are split into per-input domains (an interval plus a set of
//! excluded points) and a residual of atoms that do not fit that shape.
//! Domains alone are decided exactly. If a residual remains, a fixed,
//! bounded set of boundary candidates is searched, which can only ever
//! prove satisfiability. Every model is checked by evaluation before it is
//! returned.

use super::{SatResult, Solver, SolverError, UnknownReason};
use crate::{
    engine::watchdog::{DeadlineWatchdog, Watchdog},
    expr::{BinaryOp, Evaluator, Expr, Model, NodeKind, UnaryOp},
    word::U256,
};
use log::{trace, warn};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

const MAX_CANDIDATES_PER_INPUT: usize = 24;
const MAX_ASSIGNMENTS: u64 = 200_000;
const POLL_EVERY: u64 = 1024;

pub struct NativeSolver {
    timeout: Duration,
}

impl Default for NativeSolver {
    fn default() -> Self {
        Self::with_timeout(Duration::new(3, 0))
    }
}

impl NativeSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Solver for NativeSolver {
    fn name(&self) -> &'static str {
        "Native"
    }

    fn check_impl(
        &self,
        constraints: &[Expr],
        watchdog: &dyn Watchdog,
    ) -> Result<SatResult, SolverError> {
        let watchdog = DeadlineWatchdog::new(watchdog, self.timeout);
        let mut problem = Problem::default();

        for constraint in constraints {
            if problem.constrain(constraint, true).is_err() {
                trace!("contradiction in constraint {}", constraint);
                return Ok(SatResult::Unsat);
            }
        }

        let mut picks = Model::new();

        for (input, domain) in &problem.domains {
            match domain.first() {
                Some(v) => {
                    picks.insert(input.to_string(), v);
                }
                None => {
                    trace!("domain of {} is empty", input);
                    return Ok(SatResult::Unsat);
                }
            }
        }

        for constraint in constraints {
            for input in constraint.inputs() {
                picks.entry(input.to_string()).or_insert(U256::ZERO);
            }
        }

        if problem.residual.is_empty() {
            return Ok(if Evaluator::new(&picks).satisfies(constraints) {
                SatResult::Sat(picks)
            } else {
                SatResult::Unknown(UnknownReason::Unsupported)
            });
        }

        problem.search(constraints, picks, &watchdog)
    }
}

#[derive(Clone, Debug)]
struct Domain {
    lo: U256,
    hi: U256,
    excluded: BTreeSet<U256>,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            lo: U256::ZERO,
            hi: U256::MAX,
            excluded: BTreeSet::new(),
        }
    }
}

impl Domain {
    fn contains(&self, v: U256) -> bool {
        self.lo <= v && v <= self.hi && !self.excluded.contains(&v)
    }

    /// Smallest admitted value.
    fn first(&self) -> Option<U256> {
        let mut v = self.lo;

        loop {
            if v > self.hi {
                return None;
            }
            if !self.excluded.contains(&v) {
                return Some(v);
            }
            if v == U256::MAX {
                return None;
            }
            v += U256::ONE;
        }
    }
}

struct Contradiction;

#[derive(Default)]
struct Problem {
    domains: BTreeMap<Arc<str>, Domain>,
    // atoms that have to evaluate to non-zero (true) or zero (false)
    residual: Vec<(Expr, bool)>,
}

impl Problem {
    fn domain(&mut self, input: &str) -> &mut Domain {
        self.domains.entry(Arc::from(input)).or_default()
    }

    fn constrain(&mut self, expr: &Expr, holds: bool) -> Result<(), Contradiction> {
        match expr.kind() {
            NodeKind::Constant(c) => {
                if (*c != U256::ZERO) == holds {
                    Ok(())
                } else {
                    Err(Contradiction)
                }
            }
            NodeKind::Input(input) => {
                if holds {
                    self.exclude(input, U256::ZERO)
                } else {
                    self.restrict(input, U256::ZERO, U256::ZERO)
                }
            }
            NodeKind::Unary(UnaryOp::IsZero, x) => self.constrain(x, !holds),
            NodeKind::Binary(BinaryOp::And, l, r) if holds && l.is_boolean() && r.is_boolean() => {
                self.constrain(l, true)?;
                self.constrain(r, true)
            }
            NodeKind::Binary(BinaryOp::Or, l, r) if !holds => {
                self.constrain(l, false)?;
                self.constrain(r, false)
            }
            NodeKind::Binary(op, l, r) => match (l.as_input(), r.as_constant(), l.as_constant(), r.as_input()) {
                (Some(x), Some(c), _, _) => self.compare(*op, x, c, holds, false, expr),
                (_, _, Some(c), Some(x)) => self.compare(*op, x, c, holds, true, expr),
                _ => {
                    self.residual.push((expr.clone(), holds));
                    Ok(())
                }
            },
            _ => {
                self.residual.push((expr.clone(), holds));
                Ok(())
            }
        }
    }

    /// `x op c`, or `c op x` if `mirrored`.
    fn compare(
        &mut self,
        op: BinaryOp,
        x: &str,
        c: U256,
        holds: bool,
        mirrored: bool,
        expr: &Expr,
    ) -> Result<(), Contradiction> {
        let op = match (op, mirrored) {
            (BinaryOp::Lt, true) => BinaryOp::Gt,
            (BinaryOp::Gt, true) => BinaryOp::Lt,
            (op, _) => op,
        };

        match (op, holds) {
            // x < c
            (BinaryOp::Lt, true) if c == U256::ZERO => Err(Contradiction),
            (BinaryOp::Lt, true) => self.restrict(x, U256::ZERO, c - U256::ONE),
            // x >= c
            (BinaryOp::Lt, false) => self.restrict(x, c, U256::MAX),
            // x > c
            (BinaryOp::Gt, true) if c == U256::MAX => Err(Contradiction),
            (BinaryOp::Gt, true) => self.restrict(x, c + U256::ONE, U256::MAX),
            // x <= c
            (BinaryOp::Gt, false) => self.restrict(x, U256::ZERO, c),
            (BinaryOp::Eq, true) => self.restrict(x, c, c),
            (BinaryOp::Eq, false) => self.exclude(x, c),
            _ => {
                self.residual.push((expr.clone(), holds));
                Ok(())
            }
        }
    }

    fn restrict(&mut self, x: &str, lo: U256, hi: U256) -> Result<(), Contradiction> {
        let domain = self.domain(x);

        domain.lo = domain.lo.max(lo);
        domain.hi = domain.hi.min(hi);

        if domain.lo > domain.hi {
            Err(Contradiction)
        } else {
            Ok(())
        }
    }

    fn exclude(&mut self, x: &str, v: U256) -> Result<(), Contradiction> {
        let domain = self.domain(x);

        domain.excluded.insert(v);

        if domain.lo == domain.hi && domain.lo == v {
            Err(Contradiction)
        } else {
            Ok(())
        }
    }

    fn candidates(&self, input: &str, pick: U256, constants: &BTreeSet<U256>) -> Vec<U256> {
        let domain = self.domains.get(input).cloned().unwrap_or_default();
        let mut values = vec![pick, domain.lo, domain.hi, U256::ZERO, U256::ONE, U256::MAX];

        for c in constants {
            values.push(*c);
            values.push(c.wrapping_add(U256::ONE));
            values.push(c.wrapping_sub(U256::ONE));
        }

        let mut seen = HashSet::new();

        values
            .into_iter()
            .filter(|v| domain.contains(*v) && seen.insert(*v))
            .take(MAX_CANDIDATES_PER_INPUT)
            .collect()
    }

    fn search(
        &self,
        constraints: &[Expr],
        picks: Model,
        watchdog: &DeadlineWatchdog,
    ) -> Result<SatResult, SolverError> {
        let mut inputs = Vec::new();
        let mut constants = BTreeSet::new();

        for (atom, _) in &self.residual {
            for input in atom.inputs() {
                if !inputs.contains(&input) {
                    inputs.push(input);
                }
            }
            collect_constants(atom, &mut constants);
        }

        let candidates = inputs
            .iter()
            .map(|input| {
                let pick = picks.get(&**input).copied().unwrap_or(U256::ZERO);
                self.candidates(input, pick, &constants)
            })
            .collect::<Vec<_>>();

        if candidates.iter().any(|c| c.is_empty()) {
            return Ok(SatResult::Unknown(UnknownReason::Unsupported));
        }

        let mut odometer = vec![0_usize; inputs.len()];
        let mut tried = 0_u64;

        loop {
            if tried % POLL_EVERY == 0 && watchdog.should_stop() {
                let reason = if watchdog.timed_out() {
                    UnknownReason::Timeout
                } else {
                    UnknownReason::Cancelled
                };
                warn!("native solver gave up after {} assignments: {}", tried, reason);
                return Ok(SatResult::Unknown(reason));
            }

            let mut model = picks.clone();

            for ((input, values), i) in inputs.iter().zip(&candidates).zip(&odometer) {
                model.insert(input.to_string(), values[*i]);
            }

            if Evaluator::new(&model).satisfies(constraints) {
                trace!("found model after {} assignments", tried + 1);
                return Ok(SatResult::Sat(model));
            }

            tried += 1;

            if tried >= MAX_ASSIGNMENTS || !advance(&mut odometer, &candidates) {
                return Ok(SatResult::Unknown(UnknownReason::Unsupported));
            }
        }
    }
}

fn advance(odometer: &mut [usize], candidates: &[Vec<U256>]) -> bool {
    for (digit, values) in odometer.iter_mut().zip(candidates).rev() {
        *digit += 1;
        if *digit < values.len() {
            return true;
        }
        *digit = 0;
    }
    false
}

fn collect_constants(expr: &Expr, constants: &mut BTreeSet<U256>) {
    let mut stack = vec![expr];
    let mut seen = HashSet::new();

    while let Some(e) = stack.pop() {
        if !seen.insert(e.id()) {
            continue;
        }
        if let Some(c) = e.as_constant() {
            constants.insert(c);
        }
        stack.extend(e.children());
    }
}
