//! Cooperative cancellation.
//!
//! The interpreter polls the watchdog before and after every step, and
//! solvers poll it while searching. Stopping is best effort: a step that is
//! already running completes, but no further step starts.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub trait Watchdog
where
    Self: Debug + Send + Sync,
{
    /// Checks if the exploration should stop as soon as possible.
    #[must_use]
    fn should_stop(&self) -> bool;
}

/// Never requests a stop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LazyWatchdog;

impl Watchdog for LazyWatchdog {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Stops once the shared flag is raised, e.g. by a signal handler or another
/// thread.
#[derive(Clone, Debug, Default)]
pub struct FlagWatchdog {
    flag: Arc<AtomicBool>,
}

impl FlagWatchdog {
    #[must_use]
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed)
    }
}

impl Watchdog for FlagWatchdog {
    fn should_stop(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Stops when either the wrapped watchdog does or the deadline has passed.
#[derive(Debug)]
pub struct DeadlineWatchdog<'a> {
    inner: &'a dyn Watchdog,
    deadline: Instant,
}

impl<'a> DeadlineWatchdog<'a> {
    pub fn new(inner: &'a dyn Watchdog, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl<'a> Watchdog for DeadlineWatchdog<'a> {
    fn should_stop(&self) -> bool {
        self.timed_out() || self.inner.should_stop()
    }
}
