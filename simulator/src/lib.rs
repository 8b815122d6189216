//! Replay synthetic TCP conversations through a shared DelayBox.
//!
//! Every conversation runs between the endpoints of one configured rule. The client sends
//! `packets` segments spaced by `interval` (the last one carries FIN) and the server answers
//! each one half an interval later. Both directions leave through their own
//! [DelayBoxDevice], and both devices share one [DelayBox], so with symmetric rules the
//! two directions of a conversation form a single flow.

use delaybox::{
    config::DelayBoxConfig,
    device::{DelayBoxDevice, NetDevice, Occupancy, QueueLimit},
    packet::{Flags, Ipv4Header, Packet, TcpHeader},
    rule::WILDCARD,
    DelayBox,
};
use delaybox_runtime::{
    deterministic::{Context, Executor},
    Clock, Metrics, Scheduler,
};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    net::SocketAddrV4,
    rc::Rc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, info};

/// IPv4 EtherType.
const PROTOCOL: u16 = 0x0800;

/// Port used by servers when a rule does not name one.
const DEFAULT_SERVER_PORT: u16 = 80;

/// First port assigned to clients when a rule does not name one.
const FIRST_CLIENT_PORT: u16 = 10_000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no rules configured")]
    NoRules,
    #[error("too many flows: {0}")]
    TooManyFlows(usize),
    #[error("simulation failed: {0}")]
    DelayBox(#[from] delaybox::Error),
    #[error("failed to schedule packet: {0}")]
    Runtime(#[from] delaybox_runtime::Error),
}

/// Shape of the generated workload.
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of conversations.
    pub flows: usize,
    /// Segments sent by each side of a conversation.
    pub packets: usize,
    /// Payload bytes per segment.
    pub size: usize,
    /// Time between consecutive segments from one side.
    pub interval: Duration,
    pub seed: u64,
    /// Transmit-queue limit of each device, in packets.
    pub queue_packets: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flows: 10,
            packets: 20,
            size: 1460,
            interval: Duration::from_millis(10),
            seed: 0,
            queue_packets: 100,
        }
    }
}

/// Outcome of one direction of one conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Direction {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub sent: usize,
    pub delivered: usize,
    /// Dropped by the flow's loss rate.
    pub dropped: usize,
    /// Discarded because the flow was cancelled before they were delivered.
    pub cancelled: usize,
    pub mean_delay: Option<Duration>,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: sent={} delivered={} dropped={} cancelled={}",
            self.source, self.destination, self.sent, self.delivered, self.dropped, self.cancelled
        )?;
        match self.mean_delay {
            Some(delay) => write!(f, " mean_delay={:.3}ms", delay.as_secs_f64() * 1000.0),
            None => write!(f, " mean_delay=-"),
        }
    }
}

/// Result of a simulation.
#[derive(Clone, Debug)]
pub struct Report {
    pub directions: Vec<Direction>,
    /// Number of times a device stopped its upstream queue.
    pub stops: usize,
    /// Virtual time at which the last event ran.
    pub elapsed: Duration,
    /// Prometheus encoding of every registered metric.
    pub metrics: String,
}

#[derive(Default)]
struct Tally {
    sent: BTreeMap<u32, SystemTime>,
    delivered: usize,
    dropped: usize,
    total_delay: Duration,
}

type Tallies = Rc<RefCell<BTreeMap<(SocketAddrV4, SocketAddrV4), Tally>>>;

/// A device that delivers instantly and records what it receives.
struct Sink {
    context: Context,
    limit: QueueLimit,
    tallies: Tallies,
    stops: usize,
}

impl NetDevice for Sink {
    type Address = SocketAddrV4;

    fn send(&mut self, packet: Packet, _: SocketAddrV4, _: u16) -> bool {
        let Ok((ip, tcp)) = packet.headers() else {
            return false;
        };
        let source = SocketAddrV4::new(ip.source, tcp.source_port);
        let destination = SocketAddrV4::new(ip.destination, tcp.destination_port);
        let now = self.context.current();
        let mut tallies = self.tallies.borrow_mut();
        let tally = tallies.entry((source, destination)).or_default();
        if let Some(sent) = tally.sent.get(&tcp.sequence) {
            tally.delivered += 1;
            tally.total_delay += now.duration_since(*sent).unwrap_or_default();
        }
        true
    }

    fn mtu(&self) -> usize {
        1500
    }

    fn limit(&self) -> QueueLimit {
        self.limit
    }

    fn occupancy(&self) -> Occupancy {
        Occupancy::default()
    }

    fn stop_queue(&mut self) {
        self.stops += 1;
    }

    fn start_queue(&mut self) {}
}

type Device = Rc<RefCell<DelayBoxDevice<Context, Sink>>>;
type Failure = Rc<RefCell<Option<delaybox::Error>>>;

/// Schedule one segment from `source` to `destination`.
#[allow(clippy::too_many_arguments)]
fn schedule_segment(
    context: &Context,
    device: &Device,
    tallies: &Tallies,
    failure: &Failure,
    at: Duration,
    source: SocketAddrV4,
    destination: SocketAddrV4,
    sequence: u32,
    flags: Flags,
    size: usize,
) -> Result<(), Error> {
    context.schedule(at, {
        let context = context.clone();
        let device = device.clone();
        let tallies = tallies.clone();
        let failure = failure.clone();
        move || {
            let ip = Ipv4Header::tcp(*source.ip(), *destination.ip(), sequence as u16);
            let mut tcp = TcpHeader::new(source.port(), destination.port(), flags);
            tcp.sequence = sequence;
            let packet = Packet::tcp(&ip, &tcp, size);
            tallies
                .borrow_mut()
                .entry((source, destination))
                .or_default()
                .sent
                .insert(sequence, context.current());

            match device.borrow_mut().send(packet, destination, PROTOCOL) {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(tally) = tallies.borrow_mut().get_mut(&(source, destination)) {
                        tally.dropped += 1;
                    }
                }
                Err(err) => {
                    failure.borrow_mut().get_or_insert(err);
                }
            }
        }
    })?;
    Ok(())
}

/// Run the workload described by `options` against the rules in `config`.
pub fn simulate(config: &DelayBoxConfig, options: &Options) -> Result<Report, Error> {
    if config.rules.is_empty() {
        return Err(Error::NoRules);
    }
    let Ok(flows) = u16::try_from(options.flows) else {
        return Err(Error::TooManyFlows(options.flows));
    };
    if FIRST_CLIENT_PORT.checked_add(flows).is_none() {
        return Err(Error::TooManyFlows(options.flows));
    }

    let (runner, context) = Executor::seeded(options.seed);
    let delay_box = Rc::new(RefCell::new(DelayBox::from_config(context.clone(), config)?));
    let tallies = Tallies::default();
    let failure = Failure::default();
    let device = |label: &str| -> Device {
        let sink = Sink {
            context: context.clone(),
            limit: QueueLimit::Packets(options.queue_packets),
            tallies: tallies.clone(),
            stops: 0,
        };
        let mut device = DelayBoxDevice::new(&context.with_label(label), sink);
        device.attach(delay_box.clone());
        Rc::new(RefCell::new(device))
    };
    let client = device("client");
    let server = device("server");

    // Stagger conversation starts across one interval
    let mut conversations = Vec::with_capacity(options.flows);
    for flow in 0..flows {
        let rule = &config.rules[flow as usize % config.rules.len()];
        let client_port = match rule.source_port {
            WILDCARD => FIRST_CLIENT_PORT + flow,
            port => port,
        };
        let server_port = match rule.destination_port {
            WILDCARD => DEFAULT_SERVER_PORT,
            port => port,
        };
        let source = SocketAddrV4::new(rule.source, client_port);
        let destination = SocketAddrV4::new(rule.destination, server_port);
        let start = options.interval * u32::from(flow) / u32::from(flows);
        debug!(%source, %destination, ?start, "scheduling conversation");

        for packet in 0..options.packets {
            let sequence = packet as u32;
            let at = start + options.interval * sequence;
            let last = packet + 1 == options.packets;
            let flags = if last {
                Flags::FIN | Flags::ACK
            } else {
                Flags::PSH | Flags::ACK
            };
            schedule_segment(
                &context,
                &client,
                &tallies,
                &failure,
                at,
                source,
                destination,
                sequence,
                flags,
                options.size,
            )?;
            schedule_segment(
                &context,
                &server,
                &tallies,
                &failure,
                at + options.interval / 2,
                destination,
                source,
                sequence,
                Flags::ACK,
                options.size,
            )?;
        }
        conversations.push((source, destination));
    }

    // Abort on the first fatal error
    let mut processed = 0;
    while runner.step() {
        processed += 1;
        if let Some(err) = failure.borrow_mut().take() {
            return Err(err.into());
        }
    }
    info!(processed, elapsed = ?context.elapsed(), "simulation complete");

    let tallies = tallies.borrow();
    let mut directions = Vec::with_capacity(conversations.len() * 2);
    for (client, server) in conversations {
        for (source, destination) in [(client, server), (server, client)] {
            let Some(tally) = tallies.get(&(source, destination)) else {
                continue;
            };
            let sent = tally.sent.len();
            directions.push(Direction {
                source,
                destination,
                sent,
                delivered: tally.delivered,
                dropped: tally.dropped,
                cancelled: sent.saturating_sub(tally.delivered + tally.dropped),
                mean_delay: (tally.delivered > 0)
                    .then(|| tally.total_delay / tally.delivered as u32),
            });
        }
    }
    let stops = client.borrow().device().stops + server.borrow().device().stops;
    Ok(Report {
        directions,
        stops,
        elapsed: context.elapsed(),
        metrics: context.encode(),
    })
}
