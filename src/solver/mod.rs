pub mod native;
#[cfg(feature = "z3")]
pub mod z3;

pub use self::native::*;
#[cfg(feature = "z3")]
pub use self::z3::*;

use crate::{
    engine::watchdog::Watchdog,
    expr::{Expr, Model},
};
use log::debug;
use std::{fmt, io};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Display, IntoStaticStr, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum UnknownReason {
    Timeout,
    Unsupported,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SatResult {
    Sat(Model),
    Unsat,
    Unknown(UnknownReason),
}

impl SatResult {
    /// Everything except a definite `Unsat` may still be reachable.
    pub fn is_feasible(&self) -> bool {
        !matches!(self, SatResult::Unsat)
    }
}

impl fmt::Display for SatResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SatResult::Sat(_) => write!(f, "sat"),
            SatResult::Unsat => write!(f, "unsat"),
            SatResult::Unknown(reason) => write!(f, "unknown ({})", reason),
        }
    }
}

/// Solver backends that can be selected by name.
#[derive(Clone, Copy, Debug, Display, EnumString, IntoStaticStr, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum SolverType {
    Native,
    #[cfg(feature = "z3")]
    Z3,
}

/// Decides satisfiability of a conjunction of constraints, where a
/// constraint holds if its word is non-zero.
///
/// Every call is independent of all previous calls.
pub trait Solver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails if the backend can not be used at all.
    fn ensure_available(&self) -> Result<(), SolverError> {
        Ok(())
    }

    fn check(&self, constraints: &[Expr], watchdog: &dyn Watchdog) -> Result<SatResult, SolverError> {
        debug!(
            "try to solve {} constraints with {} solver",
            constraints.len(),
            self.name()
        );

        if watchdog.should_stop() {
            return Ok(SatResult::Unknown(UnknownReason::Cancelled));
        }

        let result = time_debug!("finished solving constraints", {
            self.check_impl(constraints, watchdog)
        });

        if let Ok(result) = &result {
            debug!("solver result: {}", result);
        }

        result
    }

    fn check_impl(
        &self,
        constraints: &[Expr],
        watchdog: &dyn Watchdog,
    ) -> Result<SatResult, SolverError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver backend is unavailable: {0}")]
    Unavailable(String),

    #[error("solver failed with IO error: {0}")]
    Io(String),

    #[error("solver backend failed: {0}")]
    Backend(String),
}

impl From<io::Error> for SolverError {
    fn from(err: io::Error) -> Self {
        SolverError::Io(err.to_string())
    }
}

/// Instantiates the solver selected by `solver_type`.
pub fn create_solver(solver_type: SolverType, timeout: std::time::Duration) -> Box<dyn Solver> {
    match solver_type {
        SolverType::Native => Box::new(NativeSolver::with_timeout(timeout)),
        #[cfg(feature = "z3")]
        SolverType::Z3 => Box::new(Z3Solver::with_timeout(timeout)),
    }
}
