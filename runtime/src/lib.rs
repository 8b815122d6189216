//! Schedule callbacks against a virtual clock.
//!
//! This crate provides a single-threaded, discrete-event runtime. Work is expressed as
//! callbacks scheduled to run at a future virtual time (there is no preemption and no
//! parallelism): the clock only advances between events, and every callback runs to
//! completion before the next one starts.
//!
//! # Terminology
//!
//! Each runtime is composed of a `Runner` and a `Context`. The `Runner` drives execution
//! (pops due events and advances time). The `Context` implements the other traits
//! ([Clock], [Scheduler], [Metrics], and `rand::RngCore`) and is handed to whatever
//! needs to read the time or schedule work.
//!
//! # Status
//!
//! `delaybox-runtime` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use prometheus_client::registry::Metric;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub mod deterministic;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug)]
pub enum Error {
    #[error("deadline overflowed the clock")]
    DeadlineOverflow,
    #[error("deadline is in the past: {0:?} before now")]
    DeadlineInPast(Duration),
}

/// Identifier of a scheduled event.
///
/// Identifiers are assigned in scheduling order and never reused, so two events with the
/// same deadline fire in the order of their identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    /// Returns the raw sequence number of the event.
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Interface that any runtime must implement to provide the current virtual time.
pub trait Clock: Clone + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;

    /// Returns the time elapsed since the runtime started.
    fn elapsed(&self) -> Duration {
        self.current()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Interface that any runtime must implement to run callbacks at a future time.
pub trait Scheduler: Clock {
    /// Run `task` once the clock reaches `deadline`.
    ///
    /// Deadlines in the past are rejected (the clock never moves backwards).
    fn schedule_at<F>(&self, deadline: SystemTime, task: F) -> Result<EventId, Error>
    where
        F: FnOnce() + 'static;

    /// Run `task` after `delay` has elapsed.
    fn schedule<F>(&self, delay: Duration, task: F) -> Result<EventId, Error>
    where
        F: FnOnce() + 'static,
    {
        let deadline = self
            .current()
            .checked_add(delay)
            .ok_or(Error::DeadlineOverflow)?;
        self.schedule_at(deadline, task)
    }

    /// Prevent a pending event from running.
    ///
    /// Returns `false` if the event already ran or was already cancelled.
    fn cancel(&self, event: EventId) -> bool;

    /// Returns whether the event is still waiting to run.
    fn is_pending(&self, event: EventId) -> bool;
}

/// Interface to register and export metrics.
pub trait Metrics: Clone + 'static {
    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// It is not permitted for any implementation to use `METRICS_PREFIX` as the start of a
    /// label (reserved for metrics for the runtime).
    fn with_label(&self, label: &str) -> Self;

    /// Register a metric with the runtime.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}
