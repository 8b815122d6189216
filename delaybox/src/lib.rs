//! Shape TCP flows with per-flow delay, loss, and bottleneck bandwidth.
//!
//! A [DelayBox] sits on a simulated link and, independently for each TCP conversation it
//! observes, imposes a propagation delay, a loss rate, and an optional bottleneck link
//! speed. All three are sampled once, when the first packet of the flow is seen, from the
//! most specific [Rule] that matches the flow's endpoints. Every later packet on the flow
//! sees the same triple.
//!
//! # Components
//!
//! - [classifier]: maps a packet's (source, destination) endpoints to a stable flow id. In
//!   symmetric mode both directions of a conversation share one id.
//! - [rule]: stores shaping rules keyed by address/port patterns and resolves a packet to
//!   the most specific one.
//! - [flow]: the per-flow delivery timeline. Packets are delivered in the order they were
//!   enqueued and never overlap on the emulated bottleneck.
//! - [table]: owns live flows, creates them lazily, and prunes cancelled ones.
//! - [DelayBox]: the facade tying the pieces together.
//! - [device]: wraps a concrete send primitive so outbound packets pass through a shared
//!   [DelayBox], with enqueue/drop traces and transmit-queue backpressure.
//!
//! # Time
//!
//! All scheduling happens on a single-threaded discrete-event runtime (see
//! `delaybox_runtime`). "Delaying" a packet means scheduling a callback at a future virtual
//! time; nothing blocks.
//!
//! # Example
//!
//! ```rust
//! use delaybox::{packet::{Flags, Ipv4Header, Packet, TcpHeader}, Config, DelayBox, Rule};
//! use delaybox_runtime::{deterministic::Executor, Clock};
//! use std::{cell::Cell, net::Ipv4Addr, rc::Rc, time::Duration};
//!
//! let (runner, context) = Executor::seeded(0);
//! let mut delay_box = DelayBox::new(context.clone(), Config::default());
//! let client = Ipv4Addr::new(10, 0, 0, 1);
//! let server = Ipv4Addr::new(10, 0, 1, 1);
//! delay_box.add_rule(client, server, Rule::new(0.05, 0.0, 0.0));
//!
//! let ip = Ipv4Header::tcp(client, server, 1);
//! let tcp = TcpHeader::new(40000, 80, Flags::ACK);
//! let packet = Packet::tcp(&ip, &tcp, 1460);
//!
//! let delivered = Rc::new(Cell::new(None));
//! let accepted = delay_box
//!     .delay(
//!         {
//!             let context = context.clone();
//!             let delivered = delivered.clone();
//!             move || delivered.set(Some(context.elapsed()))
//!         },
//!         &packet,
//!     )
//!     .unwrap();
//! assert!(accepted);
//!
//! runner.run();
//! assert_eq!(delivered.get(), Some(Duration::from_millis(50)));
//! ```

use thiserror::Error;

pub mod classifier;
pub mod config;
pub mod device;
mod engine;
pub mod flow;
mod metrics;
pub mod packet;
pub mod rule;
pub mod table;

pub use classifier::{Classification, Classifier, FlowId, FlowKey};
pub use engine::{Config, DelayBox};
pub use rule::{Distribution, Rule, RuleTable};

/// Errors that can occur when shaping traffic.
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer truncated: needed {needed} bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },
    #[error("invalid IP version: {0}")]
    InvalidVersion(u8),
    #[error("invalid header length: {0} words")]
    InvalidHeaderLength(u8),
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),
    #[error("sampled delay must be non-negative and finite: {0}")]
    NegativeDelay(f64),
    #[error("sampled loss rate must be in [0, 1]: {0}")]
    InvalidLossRate(f64),
    #[error("sampled link speed must be non-negative and finite: {0}")]
    InvalidLinkSpeed(f64),
    #[error("failed to schedule delivery: {0}")]
    Schedule(#[from] delaybox_runtime::Error),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Config(#[from] serde_yaml::Error),
}
