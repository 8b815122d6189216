//! IPv4 and TCP headers, as seen on a packet leaving a forwarding node.
//!
//! Only the fields needed for classification (addresses, ports, protocol, identification)
//! and FIN detection are interpreted. Options are skipped on read and never written.

use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{fmt, net::Ipv4Addr, ops::BitOr};

/// IP protocol number for TCP.
pub const TCP_PROTOCOL: u8 = 6;

/// Length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// Length of a TCP header without options.
pub const TCP_HEADER_LEN: usize = 20;

fn at_least(buf: &impl Buf, needed: usize) -> Result<(), Error> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(Error::Truncated { needed, remaining });
    }
    Ok(())
}

/// An IPv4 header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header for a TCP segment between `source` and `destination`.
    ///
    /// `total_length` and `checksum` are filled in by [Packet::tcp].
    pub fn tcp(source: Ipv4Addr, destination: Ipv4Addr, identification: u16) -> Self {
        Self {
            tos: 0,
            total_length: 0,
            identification,
            flags_fragment: 0,
            ttl: 64,
            protocol: TCP_PROTOCOL,
            checksum: 0,
            source,
            destination,
        }
    }

    /// Reads a header from the buffer, consuming it (and any options).
    pub fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        at_least(buf, IPV4_HEADER_LEN)?;
        let version_ihl = buf.get_u8();
        let version = version_ihl >> 4;
        if version != 4 {
            return Err(Error::InvalidVersion(version));
        }
        let ihl = version_ihl & 0x0f;
        if ihl < 5 {
            return Err(Error::InvalidHeaderLength(ihl));
        }
        let header = Self {
            tos: buf.get_u8(),
            total_length: buf.get_u16(),
            identification: buf.get_u16(),
            flags_fragment: buf.get_u16(),
            ttl: buf.get_u8(),
            protocol: buf.get_u8(),
            checksum: buf.get_u16(),
            source: Ipv4Addr::from(buf.get_u32()),
            destination: Ipv4Addr::from(buf.get_u32()),
        };

        // Skip options
        let options = ihl as usize * 4 - IPV4_HEADER_LEN;
        at_least(buf, options)?;
        buf.advance(options);
        Ok(header)
    }

    /// Writes the header (without options) to the buffer.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(0x45);
        buf.put_u8(self.tos);
        buf.put_u16(self.total_length);
        buf.put_u16(self.identification);
        buf.put_u16(self.flags_fragment);
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u16(self.checksum);
        buf.put_u32(self.source.into());
        buf.put_u32(self.destination.into());
    }

    /// Computes the header checksum (treating the checksum field as zero).
    pub fn compute_checksum(&self) -> u16 {
        let mut encoded = BytesMut::with_capacity(IPV4_HEADER_LEN);
        Self {
            checksum: 0,
            ..self.clone()
        }
        .write(&mut encoded);
        let mut sum = encoded
            .chunks(2)
            .map(|word| u32::from(u16::from_be_bytes([word[0], word[1]])))
            .sum::<u32>();
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// TCP control flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Returns true if every flag in `other` is also set in `self`.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::FIN, "FIN"),
            (Flags::SYN, "SYN"),
            (Flags::RST, "RST"),
            (Flags::PSH, "PSH"),
            (Flags::ACK, "ACK"),
            (Flags::URG, "URG"),
        ];
        let set = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>();
        write!(f, "Flags({})", set.join("|"))
    }
}

/// A TCP header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn new(source_port: u16, destination_port: u16, flags: Flags) -> Self {
        Self {
            source_port,
            destination_port,
            sequence: 0,
            acknowledgement: 0,
            flags,
            window: u16::MAX,
            checksum: 0,
            urgent: 0,
        }
    }

    /// Reads a header from the buffer, consuming it (and any options).
    pub fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        at_least(buf, TCP_HEADER_LEN)?;
        let source_port = buf.get_u16();
        let destination_port = buf.get_u16();
        let sequence = buf.get_u32();
        let acknowledgement = buf.get_u32();
        let offset = buf.get_u8() >> 4;
        if offset < 5 {
            return Err(Error::InvalidHeaderLength(offset));
        }
        let header = Self {
            source_port,
            destination_port,
            sequence,
            acknowledgement,
            flags: Flags(buf.get_u8() & 0x3f),
            window: buf.get_u16(),
            checksum: buf.get_u16(),
            urgent: buf.get_u16(),
        };

        // Skip options
        let options = offset as usize * 4 - TCP_HEADER_LEN;
        at_least(buf, options)?;
        buf.advance(options);
        Ok(header)
    }

    /// Writes the header (without options) to the buffer.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u32(self.sequence);
        buf.put_u32(self.acknowledgement);
        buf.put_u8(5 << 4);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        buf.put_u16(self.checksum);
        buf.put_u16(self.urgent);
    }
}

/// A packet starting at its IPv4 header (no link-layer framing).
///
/// Cloning is cheap: the underlying buffer is reference counted and stays valid until every
/// clone (including one captured by a pending delivery) is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Bytes);

impl Packet {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Build a TCP/IPv4 packet carrying `payload_len` zero bytes.
    ///
    /// The IP total length and header checksum are computed from the arguments.
    pub fn tcp(ip: &Ipv4Header, tcp: &TcpHeader, payload_len: usize) -> Self {
        let len = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload_len;
        let mut ip = ip.clone();
        ip.total_length = u16::try_from(len).unwrap_or(u16::MAX);
        ip.checksum = ip.compute_checksum();

        let mut buf = BytesMut::with_capacity(len);
        ip.write(&mut buf);
        tcp.write(&mut buf);
        buf.put_bytes(0, payload_len);
        Self(buf.freeze())
    }

    /// Size of the packet in bytes (headers included).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    /// Parse the IPv4 header and the TCP header that follows it.
    ///
    /// The TCP header is read regardless of the IP protocol number; classification decides
    /// whether the result is meaningful.
    pub fn headers(&self) -> Result<(Ipv4Header, TcpHeader), Error> {
        let mut buf = self.0.clone();
        let ip = Ipv4Header::read(&mut buf)?;
        let tcp = TcpHeader::read(&mut buf)?;
        Ok((ip, tcp))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 1, 1))
    }

    #[test]
    fn test_tcp_packet_headers() {
        let (client, server) = endpoints();
        let ip = Ipv4Header::tcp(client, server, 7);
        let mut tcp = TcpHeader::new(40000, 80, Flags::SYN | Flags::ACK);
        tcp.sequence = 1000;
        tcp.acknowledgement = 2000;
        let packet = Packet::tcp(&ip, &tcp, 100);
        assert_eq!(packet.len(), 140);

        let (parsed_ip, parsed_tcp) = packet.headers().unwrap();
        assert_eq!(parsed_ip.source, client);
        assert_eq!(parsed_ip.destination, server);
        assert_eq!(parsed_ip.identification, 7);
        assert_eq!(parsed_ip.protocol, TCP_PROTOCOL);
        assert_eq!(parsed_ip.total_length, 140);
        assert_eq!(parsed_tcp, tcp);
        assert!(parsed_tcp.flags.contains(Flags::SYN));
        assert!(!parsed_tcp.flags.contains(Flags::FIN));
    }

    #[test]
    fn test_checksum_verifies() {
        let (client, server) = endpoints();
        let packet = Packet::tcp(
            &Ipv4Header::tcp(client, server, 1),
            &TcpHeader::new(1, 2, Flags::ACK),
            0,
        );
        let (ip, _) = packet.headers().unwrap();
        assert_ne!(ip.checksum, 0);
        assert_eq!(ip.checksum, ip.compute_checksum());

        // Summing the header including its checksum yields all ones
        let mut sum = packet.bytes()[..IPV4_HEADER_LEN]
            .chunks(2)
            .map(|word| u32::from(u16::from_be_bytes([word[0], word[1]])))
            .sum::<u32>();
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum, 0xffff);
    }

    #[test]
    fn test_options_skipped() {
        let (client, server) = endpoints();
        let mut buf = BytesMut::new();
        // IHL of 6 (one word of options)
        let mut ip = BytesMut::new();
        Ipv4Header::tcp(client, server, 3).write(&mut ip);
        ip[0] = 0x46;
        buf.extend_from_slice(&ip);
        buf.put_u32(0x01010101);
        // Data offset of 7 (two words of options)
        let mut tcp = BytesMut::new();
        TcpHeader::new(5000, 443, Flags::FIN | Flags::ACK).write(&mut tcp);
        tcp[12] = 7 << 4;
        buf.extend_from_slice(&tcp);
        buf.put_u64(0);

        let (ip, tcp) = Packet::new(buf.freeze()).headers().unwrap();
        assert_eq!(ip.destination, server);
        assert_eq!(tcp.destination_port, 443);
        assert!(tcp.flags.contains(Flags::FIN));
    }

    #[test]
    fn test_truncated() {
        let (client, server) = endpoints();
        let packet = Packet::tcp(
            &Ipv4Header::tcp(client, server, 1),
            &TcpHeader::new(1, 2, Flags::ACK),
            0,
        );
        let short = Packet::new(packet.bytes().slice(..36));
        assert!(matches!(
            short.headers(),
            Err(Error::Truncated {
                needed: 20,
                remaining: 16
            })
        ));
    }

    #[test]
    fn test_invalid_version() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x65);
        buf.put_bytes(0, 39);
        assert!(matches!(
            Packet::new(buf.freeze()).headers(),
            Err(Error::InvalidVersion(6))
        ));
    }

    #[test]
    fn test_invalid_header_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x44);
        buf.put_bytes(0, 39);
        assert!(matches!(
            Packet::new(buf.freeze()).headers(),
            Err(Error::InvalidHeaderLength(4))
        ));
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", Flags::SYN | Flags::ACK), "Flags(SYN|ACK)");
        assert_eq!(format!("{:?}", Flags::empty()), "Flags()");
    }
}
