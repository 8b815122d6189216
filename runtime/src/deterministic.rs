//! A deterministic runtime that runs scheduled callbacks in virtual-time order.
//!
//! Events are kept in a min-heap keyed by `(deadline, id)`. The runner repeatedly pops the
//! earliest event, advances the clock to its deadline, and invokes its callback. Events that
//! share a deadline run in the order they were scheduled. Cancelling an event drops its
//! callback immediately; the stale heap entry is skipped when it is popped.
//!
//! # Panics
//!
//! If a callback panics, the runner will panic. If a `timeout` is configured and the clock
//! would advance past it, the runner panics with "runtime timeout".
//!
//! # Example
//!
//! ```rust
//! use delaybox_runtime::{deterministic::Executor, Clock, Scheduler};
//! use std::time::Duration;
//!
//! let (runner, context) = Executor::seeded(0);
//! context
//!     .schedule(Duration::from_millis(50), {
//!         let context = context.clone();
//!         move || println!("fired at {:?}", context.elapsed())
//!     })
//!     .unwrap();
//! runner.run();
//! assert_eq!(context.elapsed(), Duration::from_millis(50));
//! ```

use crate::{Clock, Error, EventId, Scheduler, METRICS_PREFIX};
use prometheus_client::{
    encoding::text::encode,
    metrics::counter::Counter,
    registry::{Metric, Registry},
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{
    cell::RefCell,
    collections::{BinaryHeap, HashMap},
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

type Task = Box<dyn FnOnce()>;

#[derive(Debug)]
struct Metrics {
    events_scheduled: Counter,
    events_cancelled: Counter,
    events_processed: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            events_scheduled: Counter::default(),
            events_cancelled: Counter::default(),
            events_processed: Counter::default(),
        };
        registry.register(
            "events_scheduled",
            "Total number of events scheduled",
            metrics.events_scheduled.clone(),
        );
        registry.register(
            "events_cancelled",
            "Total number of events cancelled before running",
            metrics.events_cancelled.clone(),
        );
        registry.register(
            "events_processed",
            "Total number of events processed",
            metrics.events_processed.clone(),
        );
        metrics
    }
}

/// Configuration for the `deterministic` runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// If the clock would advance past this point (measured from the start of the run), panic.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            timeout: None,
        }
    }
}

struct Alarm {
    time: SystemTime,
    id: EventId,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time.eq(&other.time) && self.id.eq(&other.id)
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap (earliest deadline, then earliest id)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct State {
    time: SystemTime,
    deadline: Option<SystemTime>,
    next_id: u64,
    alarms: BinaryHeap<Alarm>,
    tasks: HashMap<EventId, Task>,
}

impl State {
    /// Drop cancelled alarms from the top of the heap and return the next live deadline.
    fn next_deadline(&mut self) -> Option<SystemTime> {
        while let Some(alarm) = self.alarms.peek() {
            if self.tasks.contains_key(&alarm.id) {
                return Some(alarm.time);
            }
            let alarm = self.alarms.pop().unwrap();
            trace!(id = alarm.id.get(), "skipping cancelled event");
        }
        None
    }

    fn advance(&mut self, to: SystemTime) {
        if let Some(deadline) = self.deadline {
            if to > deadline {
                panic!("runtime timeout");
            }
        }
        if to > self.time {
            self.time = to;
        }
    }
}

/// Deterministic runtime that processes events in virtual-time order.
pub struct Executor {
    registry: RefCell<Registry>,
    metrics: Metrics,
    rng: RefCell<StdRng>,
    state: RefCell<State>,
}

impl Executor {
    /// Initialize a new `deterministic` runtime with the given configuration.
    pub fn init(cfg: Config) -> (Runner, Context) {
        // Create a new registry
        let mut registry = Registry::default();
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));

        // Initialize runtime
        let start_time = UNIX_EPOCH;
        let deadline = cfg
            .timeout
            .map(|timeout| start_time.checked_add(timeout).expect("timeout overflowed"));
        let executor = Rc::new(Self {
            registry: RefCell::new(registry),
            metrics,
            rng: RefCell::new(StdRng::seed_from_u64(cfg.seed)),
            state: RefCell::new(State {
                time: start_time,
                deadline,
                next_id: 0,
                alarms: BinaryHeap::new(),
                tasks: HashMap::new(),
            }),
        });
        (
            Runner {
                executor: executor.clone(),
            },
            Context {
                label: String::new(),
                executor,
            },
        )
    }

    /// Initialize a new `deterministic` runtime with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> (Runner, Context) {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` runtime with the default configuration
    /// but panic if the clock passes the given timeout.
    pub fn timed(timeout: Duration) -> (Runner, Context) {
        let cfg = Config {
            timeout: Some(timeout),
            ..Config::default()
        };
        Self::init(cfg)
    }
}

/// Drives a `deterministic` runtime.
pub struct Runner {
    executor: Rc<Executor>,
}

impl Runner {
    /// Process the next pending event, advancing the clock to its deadline.
    ///
    /// Returns `false` if there was nothing left to run.
    pub fn step(&self) -> bool {
        let (id, task) = {
            let mut state = self.executor.state.borrow_mut();
            let Some(time) = state.next_deadline() else {
                return false;
            };
            let alarm = state.alarms.pop().unwrap();
            let task = state.tasks.remove(&alarm.id).unwrap();
            state.advance(time);
            (alarm.id, task)
        };

        // The task may schedule or cancel other events, so no borrow is held while it runs.
        trace!(id = id.get(), "processing event");
        self.executor.metrics.events_processed.inc();
        task();
        true
    }

    /// Process events until none remain.
    ///
    /// Returns the number of events processed.
    pub fn run(&self) -> usize {
        let mut processed = 0;
        while self.step() {
            processed += 1;
        }
        trace!(processed, "runtime idle");
        processed
    }

    /// Process every event due at or before `deadline`, then advance the clock to `deadline`.
    ///
    /// Returns the number of events processed.
    pub fn run_until(&self, deadline: SystemTime) -> usize {
        let mut processed = 0;
        loop {
            let next = self.executor.state.borrow_mut().next_deadline();
            match next {
                Some(time) if time <= deadline => {
                    self.step();
                    processed += 1;
                }
                _ => break,
            }
        }
        self.executor.state.borrow_mut().advance(deadline);
        processed
    }

    /// Process events for `duration` of virtual time.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = {
            let state = self.executor.state.borrow();
            state
                .time
                .checked_add(duration)
                .expect("executor time overflowed")
        };
        self.run_until(deadline)
    }
}

/// Implementation of [`crate::Clock`], [`crate::Scheduler`], [`crate::Metrics`], and
/// `rand::RngCore` for the `deterministic` runtime.
///
/// `Context` is cheap to clone and intentionally `!Send`: the runtime (and everything that
/// holds a handle to it) belongs to the thread that drives the `Runner`.
#[derive(Clone)]
pub struct Context {
    label: String,
    executor: Rc<Executor>,
}

impl Context {
    /// Number of events that are scheduled and not yet run or cancelled.
    pub fn pending(&self) -> usize {
        self.executor.state.borrow().tasks.len()
    }
}

impl Clock for Context {
    fn current(&self) -> SystemTime {
        self.executor.state.borrow().time
    }
}

impl Scheduler for Context {
    fn schedule_at<F>(&self, deadline: SystemTime, task: F) -> Result<EventId, Error>
    where
        F: FnOnce() + 'static,
    {
        let mut state = self.executor.state.borrow_mut();
        if let Ok(behind) = state.time.duration_since(deadline) {
            if !behind.is_zero() {
                return Err(Error::DeadlineInPast(behind));
            }
        }
        let id = EventId(state.next_id);
        state.next_id += 1;
        state.alarms.push(Alarm { time: deadline, id });
        state.tasks.insert(id, Box::new(task));
        self.executor.metrics.events_scheduled.inc();
        trace!(id = id.get(), ?deadline, "scheduled event");
        Ok(id)
    }

    fn cancel(&self, event: EventId) -> bool {
        let task = self.executor.state.borrow_mut().tasks.remove(&event);
        let Some(task) = task else {
            return false;
        };

        // Dropping the task may run arbitrary destructors (which may use this context)
        drop(task);
        self.executor.metrics.events_cancelled.inc();
        trace!(id = event.get(), "cancelled event");
        true
    }

    fn is_pending(&self, event: EventId) -> bool {
        self.executor.state.borrow().tasks.contains_key(&event)
    }
}

impl crate::Metrics for Context {
    fn with_label(&self, label: &str) -> Self {
        let label = {
            let prefix = self.label.clone();
            if prefix.is_empty() {
                label.to_string()
            } else {
                format!("{}_{}", prefix, label)
            }
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        Self {
            label,
            executor: self.executor.clone(),
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed_name = {
            let prefix = &self.label;
            if prefix.is_empty() {
                name
            } else {
                format!("{}_{}", *prefix, name)
            }
        };
        self.executor
            .registry
            .borrow_mut()
            .register(prefixed_name, help.into(), metric)
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.borrow()).expect("encoding failed");
        buffer
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.executor.rng.borrow_mut().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.rng.borrow_mut().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.rng.borrow_mut().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.rng.borrow_mut().try_fill_bytes(dest)
    }
}
