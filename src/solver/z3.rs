//! Z3 backend. Constraints are handed over as an SMT-LIB script, so the
//! translation lives in one place and is shared with the reports.

use super::{SatResult, Solver, SolverError, UnknownReason};
use crate::{
    engine::watchdog::Watchdog,
    expr::{smtlib::Script, Expr, Model},
    util::parse_u256,
    word::U256,
};
use log::{trace, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use z3_solver::{
    ast::{Ast, BV},
    Config, Context, Params, SatResult as Z3SatResult, Solver as Z3,
};

const WATCH_INTERVAL: Duration = Duration::from_millis(10);

pub struct Z3Solver {
    timeout: Duration,
}

impl Default for Z3Solver {
    fn default() -> Self {
        Self::with_timeout(Duration::new(3, 0))
    }
}

impl Z3Solver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Solver for Z3Solver {
    fn name(&self) -> &'static str {
        "Z3"
    }

    fn ensure_available(&self) -> Result<(), SolverError> {
        let ctx = Context::new(&Config::new());
        let solver = Z3::new(&ctx);

        match solver.check() {
            Z3SatResult::Sat => Ok(()),
            _ => Err(SolverError::Unavailable(
                "z3 failed to decide the empty problem".to_string(),
            )),
        }
    }

    fn check_impl(
        &self,
        constraints: &[Expr],
        watchdog: &dyn Watchdog,
    ) -> Result<SatResult, SolverError> {
        let script = Script::new(constraints);

        trace!("z3 query:\n{}", script);

        let ctx = Context::new(&Config::new());
        let solver = Z3::new(&ctx);
        let mut params = Params::new(&ctx);

        params.set_u32("timeout", self.timeout.as_millis().min(u128::from(u32::MAX)) as u32);
        solver.set_params(&params);
        solver.from_string(script.to_string());

        let handle = ctx.handle();
        let finished = AtomicBool::new(false);
        let interrupted = AtomicBool::new(false);

        let result = thread::scope(|scope| {
            scope.spawn(|| {
                while !finished.load(Ordering::Relaxed) {
                    if watchdog.should_stop() {
                        interrupted.store(true, Ordering::Relaxed);
                        handle.interrupt();
                        return;
                    }
                    thread::sleep(WATCH_INTERVAL);
                }
            });

            let result = solver.check();

            finished.store(true, Ordering::Relaxed);

            result
        });

        match result {
            Z3SatResult::Sat => {
                let model = solver
                    .get_model()
                    .ok_or_else(|| SolverError::Backend("sat without a model".to_string()))?;

                let mut assignment = Model::new();

                for input in script.inputs() {
                    let bv = BV::new_const(&ctx, input.as_str(), 256);
                    let value = model
                        .eval(&bv, true)
                        .and_then(|v| parse_numeral(&v.to_string()))
                        .ok_or_else(|| {
                            SolverError::Backend(format!("no value for input {}", input))
                        })?;

                    assignment.insert(input.clone(), value);
                }

                Ok(SatResult::Sat(assignment))
            }
            Z3SatResult::Unsat => Ok(SatResult::Unsat),
            Z3SatResult::Unknown => {
                let reason = solver.get_reason_unknown().unwrap_or_default();

                warn!("z3 returned unknown: {}", reason);

                Ok(SatResult::Unknown(if interrupted.load(Ordering::Relaxed) {
                    UnknownReason::Cancelled
                } else if reason.contains("timeout") || reason.contains("canceled") {
                    UnknownReason::Timeout
                } else {
                    UnknownReason::Unsupported
                }))
            }
        }
    }
}

fn parse_numeral(s: &str) -> Option<U256> {
    if let Some(hex) = s.strip_prefix("#x") {
        U256::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("#b") {
        U256::from_str_radix(bin, 2).ok()
    } else {
        parse_u256(s)
    }
}
