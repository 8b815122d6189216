use crate::{
    classifier::Classifier,
    config::DelayBoxConfig,
    packet::Packet,
    rule::{Rule, RuleTable},
    table::{FlowTable, DEFAULT_PRUNE_THRESHOLD},
    Error,
};
use delaybox_runtime::Scheduler;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, trace, warn};

/// Packets shorter than this cannot carry the TCP ports and flags needed to classify them.
const MIN_PACKET_LEN: usize = 36;

/// Configuration for a [DelayBox].
#[derive(Clone, Debug)]
pub struct Config {
    /// Whether both directions of a conversation share one flow (and one rule).
    pub symmetric: bool,

    /// Number of flows the table may hold before cancelled flows are swept.
    pub prune_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symmetric: true,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
        }
    }
}

/// Applies per-flow delay, loss, and bandwidth limits to TCP packets.
///
/// One `DelayBox` is typically shared (via `Rc<RefCell<_>>`) by every device on a link so
/// that both directions of a conversation land in the same flow.
pub struct DelayBox<E: Scheduler + Rng> {
    symmetric: bool,
    classifier: Classifier,
    rules: RuleTable,
    flows: FlowTable<E>,
}

impl<E: Scheduler + Rng> DelayBox<E> {
    pub fn new(context: E, cfg: Config) -> Self {
        Self {
            symmetric: cfg.symmetric,
            classifier: Classifier::new(cfg.symmetric),
            rules: RuleTable::new(),
            flows: FlowTable::new(context, cfg.prune_threshold),
        }
    }

    /// Build a box holding every rule in `config`.
    pub fn from_config(context: E, config: &DelayBoxConfig) -> Result<Self, Error> {
        let mut delay_box = Self::new(context, config.engine());
        for rule in &config.rules {
            let previous = delay_box.add_port_rule(
                rule.source,
                rule.source_port,
                rule.destination,
                rule.destination_port,
                rule.rule()?,
            );
            if previous.is_some() {
                warn!(
                    source = %rule.source,
                    destination = %rule.destination,
                    "rule replaced an earlier rule for the same endpoints"
                );
            }
        }
        debug!(rules = delay_box.rules.len(), "loaded rules");
        Ok(delay_box)
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// Choose whether rules and flows match both directions of a conversation.
    ///
    /// Rules added and flows classified before the change keep the mode they were created
    /// with, so this should be called before any rule is added.
    pub fn set_symmetric(&mut self, symmetric: bool) {
        self.symmetric = symmetric;
        self.classifier.set_symmetric(symmetric);
    }

    /// Shape all traffic between `source` and `destination` (any ports) with `rule`.
    ///
    /// Returns the rule previously stored for the same key, if any.
    pub fn add_rule(
        &mut self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        rule: Rule,
    ) -> Option<Rule> {
        self.rules.add(source, destination, self.symmetric, rule)
    }

    /// Shape traffic between specific endpoints with `rule` (port `0` matches any port).
    pub fn add_port_rule(
        &mut self,
        source: Ipv4Addr,
        source_port: u16,
        destination: Ipv4Addr,
        destination_port: u16,
        rule: Rule,
    ) -> Option<Rule> {
        self.rules.add_ports(
            SocketAddrV4::new(source, source_port),
            SocketAddrV4::new(destination, destination_port),
            self.symmetric,
            rule,
        )
    }

    /// Deliver `packet` by calling `send`, now or after the delay of its flow.
    ///
    /// Returns `Ok(false)` if the packet was dropped (and `send` will never be called).
    /// Packets that cannot be classified or that match no rule are sent immediately. An
    /// `Err` means a rule produced unusable flow parameters and the run should be aborted.
    pub fn delay<F>(&mut self, send: F, packet: &Packet) -> Result<bool, Error>
    where
        F: FnOnce() + 'static,
    {
        if packet.len() < MIN_PACKET_LEN {
            trace!(len = packet.len(), "packet too short to classify");
            send();
            return Ok(true);
        }
        let (ip, tcp) = match packet.headers() {
            Ok(headers) => headers,
            Err(err) => {
                warn!(?err, "failed to parse packet headers");
                send();
                return Ok(true);
            }
        };
        let source = SocketAddrV4::new(ip.source, tcp.source_port);
        let destination = SocketAddrV4::new(ip.destination, tcp.destination_port);
        trace!(%source, %destination, flags = ?tcp.flags, "considering packet");

        let Some(classification) = self.classifier.classify(&ip, &tcp) else {
            warn!(%source, %destination, protocol = ip.protocol, "failed to classify packet");
            send();
            return Ok(true);
        };
        let Some(rule) = self.rules.lookup(source, destination, self.symmetric) else {
            debug!(%source, %destination, "no rule matched; sending immediately");
            send();
            return Ok(true);
        };
        self.flows.enqueue(
            classification.flow,
            rule,
            send,
            packet.len(),
            tcp.flags,
        )
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn flows(&self) -> &FlowTable<E> {
        &self.flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Flags, Ipv4Header, TcpHeader};
    use bytes::Bytes;
    use delaybox_runtime::{
        deterministic::{Context, Executor, Runner},
        Clock,
    };
    use std::{cell::RefCell, rc::Rc, time::Duration};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const OTHER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 1);

    type Log = Rc<RefCell<Vec<(&'static str, Duration)>>>;

    fn setup(cfg: Config) -> (Runner, Context, DelayBox<Context>, Log) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
        let (runner, context) = Executor::seeded(0);
        let delay_box = DelayBox::new(context.clone(), cfg);
        (runner, context, delay_box, Log::default())
    }

    fn packet(
        source: Ipv4Addr,
        source_port: u16,
        destination: Ipv4Addr,
        destination_port: u16,
        flags: Flags,
        payload: usize,
    ) -> Packet {
        Packet::tcp(
            &Ipv4Header::tcp(source, destination, 1),
            &TcpHeader::new(source_port, destination_port, flags),
            payload,
        )
    }

    fn recorder(context: &Context, log: &Log, name: &'static str) -> impl FnOnce() + 'static {
        let context = context.clone();
        let log = log.clone();
        move || log.borrow_mut().push((name, context.elapsed()))
    }

    #[test]
    fn test_matching_packet_delayed() {
        let (runner, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.05, 0.0, 0.0));

        let first = packet(CLIENT, 40000, SERVER, 80, Flags::ACK, 1460);
        assert_eq!(first.len(), 1500);
        assert!(delay_box
            .delay(recorder(&context, &log, "first"), &first)
            .unwrap());
        assert!(log.borrow().is_empty());

        // A second packet arrives at 10ms
        runner.run_for(Duration::from_millis(10));
        let second = packet(CLIENT, 40000, SERVER, 80, Flags::ACK, 960);
        assert!(delay_box
            .delay(recorder(&context, &log, "second"), &second)
            .unwrap());

        runner.run();
        assert_eq!(
            *log.borrow(),
            vec![
                ("first", Duration::from_millis(50)),
                ("second", Duration::from_millis(60)),
            ]
        );
        assert_eq!(delay_box.flows().len(), 1);
    }

    #[test]
    fn test_short_packet_bypasses() {
        let (_, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.05, 1.0, 0.0));
        let short = Packet::new(Bytes::from_static(&[0u8; 20]));
        assert!(delay_box
            .delay(recorder(&context, &log, "short"), &short)
            .unwrap());
        assert_eq!(*log.borrow(), vec![("short", Duration::ZERO)]);
        assert!(delay_box.classifier().is_empty());
    }

    #[test]
    fn test_malformed_packet_bypasses() {
        let (_, context, mut delay_box, log) = setup(Config::default());
        let garbage = Packet::new(Bytes::from(vec![0x60u8; 60]));
        assert!(delay_box
            .delay(recorder(&context, &log, "garbage"), &garbage)
            .unwrap());
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_unclassifiable_packet_bypasses() {
        let (_, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, Ipv4Addr::BROADCAST, Rule::new(0.05, 0.0, 0.0));
        let broadcast = packet(CLIENT, 40000, Ipv4Addr::BROADCAST, 80, Flags::ACK, 100);
        assert!(delay_box
            .delay(recorder(&context, &log, "broadcast"), &broadcast)
            .unwrap());
        assert_eq!(log.borrow().len(), 1);
        assert!(delay_box.flows().is_empty());
    }

    #[test]
    fn test_unmatched_packet_bypasses() {
        let (_, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.05, 0.0, 0.0));
        let unmatched = packet(CLIENT, 40000, OTHER, 80, Flags::ACK, 100);
        assert!(delay_box
            .delay(recorder(&context, &log, "unmatched"), &unmatched)
            .unwrap());
        assert_eq!(*log.borrow(), vec![("unmatched", Duration::ZERO)]);
        assert!(delay_box.flows().is_empty());
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_loss_returns_false() {
        let (runner, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.05, 1.0, 0.0));
        let lost = packet(CLIENT, 40000, SERVER, 80, Flags::ACK, 100);
        assert!(!delay_box
            .delay(recorder(&context, &log, "lost"), &lost)
            .unwrap());
        runner.run();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let (runner, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.1, 0.0, 0.0));
        delay_box.add_port_rule(CLIENT, 0, SERVER, 443, Rule::new(0.02, 0.0, 0.0));
        delay_box.add_port_rule(CLIENT, 5000, SERVER, 443, Rule::new(0.01, 0.0, 0.0));

        for (name, source_port, destination_port) in [
            ("exact", 5000, 443),
            ("destination port", 5001, 443),
            ("hosts", 5002, 80),
        ] {
            let packet = packet(CLIENT, source_port, SERVER, destination_port, Flags::ACK, 100);
            delay_box
                .delay(recorder(&context, &log, name), &packet)
                .unwrap();
        }
        runner.run();
        assert_eq!(
            *log.borrow(),
            vec![
                ("exact", Duration::from_millis(10)),
                ("destination port", Duration::from_millis(20)),
                ("hosts", Duration::from_millis(100)),
            ]
        );
    }

    #[test]
    fn test_symmetric_matches_reverse_direction() {
        let (runner, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_port_rule(CLIENT, 0, SERVER, 80, Rule::new(0.03, 0.0, 0.0));

        let request = packet(CLIENT, 40000, SERVER, 80, Flags::SYN, 0);
        let response = packet(SERVER, 80, CLIENT, 40000, Flags::SYN | Flags::ACK, 0);
        delay_box
            .delay(recorder(&context, &log, "request"), &request)
            .unwrap();
        delay_box
            .delay(recorder(&context, &log, "response"), &response)
            .unwrap();

        // Both directions share one flow
        assert_eq!(delay_box.classifier().len(), 1);
        assert_eq!(delay_box.flows().len(), 1);
        runner.run();
        assert_eq!(
            *log.borrow(),
            vec![
                ("request", Duration::from_millis(30)),
                ("response", Duration::from_millis(30)),
            ]
        );
    }

    #[test]
    fn test_directional_matches_one_direction() {
        let (runner, context, mut delay_box, log) = setup(Config {
            symmetric: false,
            ..Config::default()
        });
        assert!(!delay_box.is_symmetric());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.03, 0.0, 0.0));

        let request = packet(CLIENT, 40000, SERVER, 80, Flags::ACK, 100);
        let response = packet(SERVER, 80, CLIENT, 40000, Flags::ACK, 100);
        delay_box
            .delay(recorder(&context, &log, "request"), &request)
            .unwrap();
        delay_box
            .delay(recorder(&context, &log, "response"), &response)
            .unwrap();
        runner.run();
        assert_eq!(
            *log.borrow(),
            vec![
                ("response", Duration::ZERO),
                ("request", Duration::from_millis(30)),
            ]
        );
        assert_eq!(delay_box.classifier().len(), 2);
        assert_eq!(delay_box.flows().len(), 1);
    }

    #[test]
    fn test_fin_disables_delay() {
        let (runner, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(0.05, 0.0, 0.0));

        let fin = packet(CLIENT, 40000, SERVER, 80, Flags::FIN | Flags::ACK, 0);
        delay_box.delay(recorder(&context, &log, "fin"), &fin).unwrap();
        runner.run();

        let late = packet(SERVER, 80, CLIENT, 40000, Flags::ACK, 0);
        assert!(delay_box
            .delay(recorder(&context, &log, "late"), &late)
            .unwrap());
        assert_eq!(
            *log.borrow(),
            vec![
                ("fin", Duration::from_millis(50)),
                ("late", Duration::from_millis(50)),
            ]
        );
    }

    #[test]
    fn test_replace_rule() {
        let (_, _, mut delay_box, _) = setup(Config::default());
        assert!(delay_box
            .add_rule(CLIENT, SERVER, Rule::new(0.05, 0.0, 0.0))
            .is_none());
        let previous = delay_box
            .add_rule(SERVER, CLIENT, Rule::new(0.1, 0.0, 0.0))
            .unwrap();
        assert_eq!(previous, Rule::new(0.05, 0.0, 0.0));
        assert_eq!(delay_box.rules().len(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = DelayBoxConfig::from_yaml(
            r#"
rules:
  - source: 10.0.0.1
    destination: 10.0.1.1
    delay: 0.1
  - source: 10.0.1.1
    destination: 10.0.0.1
    source_port: 443
    delay: 0.01
"#,
        )
        .unwrap();
        let (runner, context) = Executor::seeded(0);
        let mut delay_box = DelayBox::from_config(context.clone(), &config).unwrap();
        assert!(delay_box.is_symmetric());
        assert_eq!(delay_box.rules().len(), 2);

        let log = Log::default();
        let https = packet(CLIENT, 40000, SERVER, 443, Flags::ACK, 100);
        let http = packet(CLIENT, 40001, SERVER, 80, Flags::ACK, 100);
        delay_box
            .delay(recorder(&context, &log, "https"), &https)
            .unwrap();
        delay_box
            .delay(recorder(&context, &log, "http"), &http)
            .unwrap();
        runner.run();
        assert_eq!(
            *log.borrow(),
            vec![
                ("https", Duration::from_millis(10)),
                ("http", Duration::from_millis(100)),
            ]
        );
    }

    #[test]
    fn test_negative_delay_is_fatal() {
        let (_, context, mut delay_box, log) = setup(Config::default());
        delay_box.add_rule(CLIENT, SERVER, Rule::new(-0.01, 0.0, 0.0));
        let packet = packet(CLIENT, 40000, SERVER, 80, Flags::ACK, 100);
        let result = delay_box.delay(recorder(&context, &log, "packet"), &packet);
        assert!(matches!(result, Err(Error::NegativeDelay(_))));
        assert!(log.borrow().is_empty());
    }
}
