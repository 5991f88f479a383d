//! Schedule contract and the interval schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::{BuildCondition, Error, Result};

/// Trigger policy for one project.
///
/// A schedule is polled by exactly one integrator loop, while `force_build`
/// may be called from any task.
pub trait Schedule: Send + Sync {
    /// Decide whether to build now. A pending force request is consumed by
    /// this call and reported as `BuildCondition::Forced`.
    fn poll(&self, now: Instant) -> Option<BuildCondition>;

    /// Request one build on the next poll, regardless of timing.
    fn force_build(&self);

    /// Record that an integration finished at `now`.
    fn integration_completed(&self, now: Instant);
}

/// One-shot force-build request shared between an admin caller and a worker.
#[derive(Debug, Default)]
pub struct ForceFlag(AtomicBool);

impl ForceFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Builds every `interval`, measured from the end of the previous integration.
///
/// With no interval the schedule is manual and only builds when forced.
#[derive(Debug)]
pub struct IntervalSchedule {
    interval: Option<Duration>,
    initial_build: bool,
    force: ForceFlag,
    last: Mutex<Option<Instant>>,
}

impl IntervalSchedule {
    /// Build immediately on the first poll, then every `interval`.
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidInput(
                "schedule interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            interval: Some(interval),
            initial_build: true,
            force: ForceFlag::new(),
            last: Mutex::new(None),
        })
    }

    /// Only build when forced.
    pub fn manual() -> Self {
        Self {
            interval: None,
            initial_build: false,
            force: ForceFlag::new(),
            last: Mutex::new(None),
        }
    }

    /// Wait a full interval after the first poll instead of building at once.
    pub fn without_initial_build(mut self) -> Self {
        self.initial_build = false;
        self
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_force_pending(&self) -> bool {
        self.force.is_set()
    }
}

impl Schedule for IntervalSchedule {
    fn poll(&self, now: Instant) -> Option<BuildCondition> {
        if self.force.take() {
            return Some(BuildCondition::Forced);
        }
        let interval = self.interval?;

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if now.saturating_duration_since(at) >= interval => {
                Some(BuildCondition::Scheduled)
            }
            Some(_) => None,
            None if self.initial_build => Some(BuildCondition::Scheduled),
            None => {
                *last = Some(now);
                None
            }
        }
    }

    fn force_build(&self) {
        self.force.set();
    }

    fn integration_completed(&self, now: Instant) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
    }
}
