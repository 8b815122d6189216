//! Classify TCP packets into flows.
//!
//! A flow is identified by the (source, destination) endpoint pair of its packets. In
//! symmetric mode the pair is sorted first, so both directions of a conversation map to the
//! same [FlowKey] (and therefore the same [FlowId]). In directional mode each direction is
//! its own flow.
//!
//! Flow ids are allocated on first sight and never reused or removed for the life of the
//! classifier.

use crate::packet::{Ipv4Header, TcpHeader, TCP_PROTOCOL};
use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, SocketAddrV4},
};

/// Identifier of a classified flow.
pub type FlowId = u32;

/// Ordered pair of endpoints identifying a flow (or a rule).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    first: SocketAddrV4,
    second: SocketAddrV4,
}

impl FlowKey {
    /// Create a key for traffic from `source` to `destination`.
    ///
    /// If `symmetric`, the endpoints are sorted into a canonical order so that the reverse
    /// direction produces an identical key.
    pub fn new(source: SocketAddrV4, destination: SocketAddrV4, symmetric: bool) -> Self {
        if symmetric && destination < source {
            return Self {
                first: destination,
                second: source,
            };
        }
        Self {
            first: source,
            second: destination,
        }
    }

    pub fn first(&self) -> SocketAddrV4 {
        self.first
    }

    pub fn second(&self) -> SocketAddrV4 {
        self.second
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.first, self.second)
    }
}

/// Result of classifying a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    /// Flow the packet belongs to.
    pub flow: FlowId,
    /// IP identification field of the packet (passed through unchanged).
    pub packet: u16,
}

/// Assigns flow ids to TCP packets.
pub struct Classifier {
    symmetric: bool,
    flows: BTreeMap<FlowKey, FlowId>,
    last: FlowId,
}

impl Classifier {
    pub fn new(symmetric: bool) -> Self {
        Self {
            symmetric,
            flows: BTreeMap::new(),
            last: 0,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// Change how directions are merged.
    ///
    /// Packets already classified keep their ids; only new keys are affected.
    pub fn set_symmetric(&mut self, symmetric: bool) {
        self.symmetric = symmetric;
    }

    /// Classify a packet, allocating a new flow id if its key has not been seen before.
    ///
    /// Returns `None` for non-TCP packets and broadcast destinations.
    pub fn classify(&mut self, ip: &Ipv4Header, tcp: &TcpHeader) -> Option<Classification> {
        if ip.protocol != TCP_PROTOCOL {
            return None;
        }
        if ip.destination == Ipv4Addr::BROADCAST {
            return None;
        }
        let key = FlowKey::new(
            SocketAddrV4::new(ip.source, tcp.source_port),
            SocketAddrV4::new(ip.destination, tcp.destination_port),
            self.symmetric,
        );
        let flow = match self.flows.get(&key) {
            Some(flow) => *flow,
            None => {
                self.last += 1;
                self.flows.insert(key, self.last);
                self.last
            }
        };
        Some(Classification {
            flow,
            packet: ip.identification,
        })
    }

    /// Find the key a flow id was assigned to.
    pub fn find(&self, flow: FlowId) -> Option<FlowKey> {
        self.flows
            .iter()
            .find(|(_, id)| **id == flow)
            .map(|(key, _)| *key)
    }

    /// Number of flows classified so far.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Flags;
    use test_case::test_case;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn headers(
        source: Ipv4Addr,
        source_port: u16,
        destination: Ipv4Addr,
        destination_port: u16,
    ) -> (Ipv4Header, TcpHeader) {
        (
            Ipv4Header::tcp(source, destination, 11),
            TcpHeader::new(source_port, destination_port, Flags::ACK),
        )
    }

    #[test]
    fn test_same_tuple_same_flow() {
        let mut classifier = Classifier::new(true);
        let (ip, tcp) = headers(CLIENT, 40000, SERVER, 80);
        let first = classifier.classify(&ip, &tcp).unwrap();
        let second = classifier.classify(&ip, &tcp).unwrap();
        assert_eq!(first.flow, 1);
        assert_eq!(first, second);
        assert_eq!(first.packet, 11);
        assert_eq!(classifier.len(), 1);
    }

    #[test_case(true, true; "symmetric merges directions")]
    #[test_case(false, false; "directional splits directions")]
    fn test_reverse_direction(symmetric: bool, same: bool) {
        let mut classifier = Classifier::new(symmetric);
        let (ip, tcp) = headers(CLIENT, 40000, SERVER, 80);
        let forward = classifier.classify(&ip, &tcp).unwrap();
        let (ip, tcp) = headers(SERVER, 80, CLIENT, 40000);
        let reverse = classifier.classify(&ip, &tcp).unwrap();
        assert_eq!(forward.flow == reverse.flow, same);
    }

    #[test]
    fn test_distinct_ports_distinct_flows() {
        let mut classifier = Classifier::new(true);
        let ids = (0..10)
            .map(|port| {
                let (ip, tcp) = headers(CLIENT, 40000 + port, SERVER, 80);
                classifier.classify(&ip, &tcp).unwrap().flow
            })
            .collect::<Vec<_>>();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_non_tcp_unclassifiable() {
        let mut classifier = Classifier::new(true);
        let (mut ip, tcp) = headers(CLIENT, 40000, SERVER, 80);
        ip.protocol = 17;
        assert!(classifier.classify(&ip, &tcp).is_none());
        assert!(classifier.is_empty());
    }

    #[test]
    fn test_broadcast_unclassifiable() {
        let mut classifier = Classifier::new(true);
        let (ip, tcp) = headers(CLIENT, 40000, Ipv4Addr::BROADCAST, 80);
        assert!(classifier.classify(&ip, &tcp).is_none());
    }

    #[test]
    fn test_find() {
        let mut classifier = Classifier::new(true);
        let (ip, tcp) = headers(SERVER, 80, CLIENT, 40000);
        let flow = classifier.classify(&ip, &tcp).unwrap().flow;
        let key = classifier.find(flow).unwrap();
        assert_eq!(key.first(), SocketAddrV4::new(CLIENT, 40000));
        assert_eq!(key.second(), SocketAddrV4::new(SERVER, 80));
        assert!(classifier.find(flow + 1).is_none());
    }

    #[test]
    fn test_key_canonical() {
        let a = SocketAddrV4::new(CLIENT, 5000);
        let b = SocketAddrV4::new(SERVER, 80);
        assert_eq!(FlowKey::new(a, b, true), FlowKey::new(b, a, true));
        assert_ne!(FlowKey::new(a, b, false), FlowKey::new(b, a, false));
        assert_eq!(FlowKey::new(b, a, false).first(), b);
    }
}
