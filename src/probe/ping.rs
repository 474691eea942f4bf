//! ICMP echo probe implementation using native sockets.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.
//! A raw socket (CAP_NET_RAW or root) is tried first, then the unprivileged
//! datagram ICMP socket where the kernel allows it.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::ProbeError;
use crate::config::LatencyAggregation;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Ping sequence counter shared by all probes.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// An opened ICMP socket and whether it is raw (privileged).
struct IcmpSocket {
    socket: Socket,
    raw: bool,
}

/// Echo requests sent in one probe and the round trips that came back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingStats {
    pub sent: u32,
    pub rtts: Vec<Duration>,
}

impl PingStats {
    /// Fold the round trips into one latency, failing when nothing came back.
    pub fn latency(&self, aggregation: LatencyAggregation) -> Result<Duration, ProbeError> {
        aggregate_rtts(&self.rtts, aggregation).ok_or(ProbeError::NoReplies { sent: self.sent })
    }
}

/// Run an ICMP probe sending up to `count` echo requests within `timeout`.
///
/// Errors only when nothing could be sent: the host does not resolve or no
/// ICMP socket could be opened. Otherwise the stats say how many echoes went
/// out and which came back.
pub async fn run_icmp_probe(
    address: &str,
    count: u32,
    timeout: Duration,
) -> Result<PingStats, ProbeError> {
    let ip = tokio::time::timeout(timeout, resolve_address(address))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    let count = count.max(1);

    tokio::task::spawn_blocking(move || run_blocking_ping(ip, count, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    super::resolve_socket_addr(address, 0).await.map(|sa| sa.ip())
}

/// Fold round trips into one latency; `None` when nothing came back.
pub fn aggregate_rtts(rtts: &[Duration], aggregation: LatencyAggregation) -> Option<Duration> {
    if rtts.is_empty() {
        return None;
    }
    match aggregation {
        LatencyAggregation::Min => rtts.iter().min().copied(),
        LatencyAggregation::Avg => Some(rtts.iter().sum::<Duration>() / rtts.len() as u32),
    }
}

fn open_icmp_socket(ip: IpAddr) -> Result<IcmpSocket, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok(IcmpSocket { socket, raw: true });
    }

    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| IcmpSocket { socket, raw: false })
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))
}

/// Send `count` echo requests one after another and collect round trips.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, count: u32, timeout: Duration) -> Result<PingStats, ProbeError> {
    let icmp = open_icmp_socket(ip)?;

    icmp.socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    icmp.socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let deadline = Instant::now() + timeout;
    let mut stats = PingStats::default();

    for index in 0..count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        // Share what is left of the deadline among the packets still to send.
        let budget = remaining / (count - index);

        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let packet = match ip {
            IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
            IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
        };

        // Start timing just before send
        let start = Instant::now();
        if let Err(e) = send_echo(&icmp, &packet) {
            if stats.sent == 0 {
                return Err(e);
            }
            tracing::debug!("ICMP send to {} failed after {} packets: {}", ip, stats.sent, e);
            break;
        }
        stats.sent += 1;

        match await_reply(&icmp, ip, identifier, sequence, start, budget) {
            Ok(Some(rtt)) => stats.rtts.push(rtt),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("ICMP receive from {} failed: {}", ip, e);
                break;
            }
        }
    }

    Ok(stats)
}

fn send_echo(icmp: &IcmpSocket, packet: &[u8]) -> Result<(), ProbeError> {
    icmp.socket.send(packet).map(|_| ()).map_err(|e| {
        if e.kind() == ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })
}

/// Wait for the reply to one echo. `Ok(None)` means it did not arrive in time.
fn await_reply(
    icmp: &IcmpSocket,
    ip: IpAddr,
    identifier: u16,
    sequence: u16,
    start: Instant,
    budget: Duration,
) -> Result<Option<Duration>, ProbeError> {
    // Receive replies until ours shows up or the budget runs out
    let mut buf = [0u8; 1500];
    loop {
        let remaining = budget.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Ok(None);
        }
        icmp.socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let len = match (&icmp.socket).read(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Ok(None);
            }
            Err(e) => return Err(ProbeError::Network(format!("Failed to receive: {}", e))),
        };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();

        // Datagram sockets on Linux rewrite the identifier, so only raw
        // sockets can match on it.
        let check_id = icmp.raw;
        let matched = match ip {
            IpAddr::V4(_) => is_echo_reply_v4(&buf[..len], identifier, sequence, check_id),
            IpAddr::V6(_) => is_echo_reply_v6(&buf[..len], identifier, sequence, check_id),
        };
        if matched {
            return Ok(Some(elapsed));
        }
        // Received something else, keep waiting
    }
}

/// Check an IPv4 datagram for our echo reply. An IP header, when present, is skipped.
fn is_echo_reply_v4(buf: &[u8], identifier: u16, sequence: u16, check_id: bool) -> bool {
    let offset = if !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    buf.len() >= offset + 8
        && matches_echo(&buf[offset..], ICMP_ECHO_REPLY, identifier, sequence, check_id)
}

/// ICMPv6 sockets never deliver the IPv6 header.
fn is_echo_reply_v6(buf: &[u8], identifier: u16, sequence: u16, check_id: bool) -> bool {
    buf.len() >= 8 && matches_echo(buf, ICMPV6_ECHO_REPLY, identifier, sequence, check_id)
}

fn matches_echo(icmp: &[u8], reply_type: u8, identifier: u16, sequence: u16, check_id: bool) -> bool {
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == reply_type && reply_seq == sequence && (!check_id || reply_id == identifier)
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = build_echo_payload(ICMP_ECHO_REQUEST, identifier, sequence);

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The checksum covers an IPv6 pseudo-header and is filled in by the kernel.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    build_echo_payload(ICMPV6_ECHO_REQUEST, identifier, sequence)
}

fn build_echo_payload(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = icmp_type;
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Fill payload with timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += word as u32;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet carrying its own checksum sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
        // Odd lengths are padded with a zero byte.
        assert_eq!(icmp_checksum(&[0xFF]), !0xFF00u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence

        let packet = build_icmpv6_echo_request(0x1234, 0x0002);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
    }

    fn reply(reply_type: u8, id: u16, seq: u16) -> Vec<u8> {
        let mut icmp = build_echo_payload(reply_type, id, seq);
        icmp.truncate(16);
        icmp
    }

    #[test]
    fn test_match_reply_without_ip_header() {
        let buf = reply(ICMP_ECHO_REPLY, 0x1111, 7);
        assert!(is_echo_reply_v4(&buf, 0x1111, 7, true));
        assert!(!is_echo_reply_v4(&buf, 0x1111, 8, true));
        assert!(!is_echo_reply_v4(&buf, 0x2222, 7, true));
        // Datagram sockets ignore the identifier.
        assert!(is_echo_reply_v4(&buf, 0x2222, 7, false));
    }

    #[test]
    fn test_match_reply_with_ip_header() {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45; // IPv4, IHL 5
        buf.extend(reply(ICMP_ECHO_REPLY, 0x1111, 7));
        assert!(is_echo_reply_v4(&buf, 0x1111, 7, true));

        // Our own request looped back is not a reply.
        let mut echo = vec![0u8; 20];
        echo[0] = 0x45;
        echo.extend(reply(ICMP_ECHO_REQUEST, 0x1111, 7));
        assert!(!is_echo_reply_v4(&echo, 0x1111, 7, true));

        assert!(!is_echo_reply_v4(&buf[..24], 0x1111, 7, true));
    }

    #[test]
    fn test_match_reply_v6() {
        let buf = reply(ICMPV6_ECHO_REPLY, 0x1111, 3);
        assert!(is_echo_reply_v6(&buf, 0x1111, 3, true));
        assert!(!is_echo_reply_v6(&reply(ICMPV6_ECHO_REQUEST, 0x1111, 3), 0x1111, 3, true));
    }

    #[test]
    fn test_aggregate_rtts() {
        let rtts = [
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ];
        assert_eq!(aggregate_rtts(&rtts, LatencyAggregation::Min), Some(Duration::from_millis(10)));
        assert_eq!(aggregate_rtts(&rtts, LatencyAggregation::Avg), Some(Duration::from_millis(20)));
        assert_eq!(
            aggregate_rtts(&rtts[..1], LatencyAggregation::Avg),
            Some(Duration::from_millis(10))
        );
        assert_eq!(aggregate_rtts(&[], LatencyAggregation::Min), None);
    }

    #[test]
    fn test_stats_latency() {
        let stats = PingStats {
            sent: 3,
            rtts: vec![Duration::from_millis(4), Duration::from_millis(8)],
        };
        assert_eq!(stats.latency(LatencyAggregation::Avg).unwrap(), Duration::from_millis(6));

        let lost = PingStats { sent: 3, rtts: vec![] };
        assert!(matches!(
            lost.latency(LatencyAggregation::Min),
            Err(ProbeError::NoReplies { sent: 3 })
        ));
    }

    #[tokio::test]
    async fn test_icmp_probe_unresolvable_host() {
        let result = run_icmp_probe("nonexistent.invalid", 1, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_icmp_probe_loopback_or_privilege_error() {
        // Depending on privileges this either sends every echo or fails to
        // open a socket; both must come back as a value, never a panic.
        let result = run_icmp_probe("127.0.0.1", 2, Duration::from_secs(1)).await;
        match result {
            Ok(stats) => {
                assert!(stats.sent >= 1 && stats.sent <= 2);
                assert!(stats.rtts.len() as u32 <= stats.sent);
                if let Ok(latency) = stats.latency(LatencyAggregation::Min) {
                    assert!(latency < Duration::from_secs(1));
                }
            }
            Err(e) => assert!(!e.to_string().is_empty()),
        }
    }
}
