//! DNS probe implementation using raw UDP packets.
//!
//! The message codec here is shared with the DNS-over-QUIC probe.

use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{resolve_socket_addr, ProbeError};

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_UDP_RESPONSE: usize = 4096;

/// Fields of a response header the probes care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsResponseHeader {
    pub id: u16,
    pub rcode: u8,
    pub truncated: bool,
    pub answer_count: u16,
}

/// Run a DNS probe: query `server:port` over UDP for `name`/`qtype`.
///
/// Returns the round-trip latency. Fails on transport errors, timeouts and
/// responses without answer records.
pub async fn run_dns_probe(
    server: &str,
    port: u16,
    name: &str,
    qtype: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    tokio::time::timeout(timeout, exchange_udp(server, port, name, qtype))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn exchange_udp(
    server: &str,
    port: u16,
    name: &str,
    qtype: u16,
) -> Result<Duration, ProbeError> {
    let target_addr = resolve_socket_addr(server, port).await?;

    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, name, qtype)?;

    let bind_addr = if target_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .connect(target_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    // Wait for the reply carrying our id; anything else is stale or spoofed.
    let mut response = vec![0u8; MAX_UDP_RESPONSE];
    let header = loop {
        let n = socket
            .recv(&mut response)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

        match parse_dns_response(&response[..n]) {
            Ok(header) if header.id == tx_id => break header,
            Ok(header) => {
                tracing::debug!("DNS probe: ignoring reply with id {} (want {})", header.id, tx_id);
            }
            Err(e) => tracing::debug!("DNS probe: ignoring malformed datagram: {}", e),
        }
    };

    let elapsed = start.elapsed();
    if header.truncated {
        tracing::debug!("DNS probe: truncated response from {}", target_addr);
    }
    ensure_answers(&header)?;

    Ok(elapsed)
}

/// Build a recursive query for `name` (class IN, type `qtype`).
pub fn build_dns_query(tx_id: u16, name: &str, qtype: u16) -> Result<Vec<u8>, ProbeError> {
    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;
    let an_count: u16 = 0;
    let ns_count: u16 = 0;
    let ar_count: u16 = 0;

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&an_count.to_be_bytes());
    packet.extend_from_slice(&ns_count.to_be_bytes());
    packet.extend_from_slice(&ar_count.to_be_bytes());

    encode_name(name, &mut packet)?;

    packet.extend_from_slice(&qtype.to_be_bytes());
    // QCLASS: IN (1)
    packet.extend_from_slice(&1u16.to_be_bytes());

    Ok(packet)
}

/// Append `name` as length-prefixed labels. A trailing dot is optional.
fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), ProbeError> {
    let fqdn = name.strip_suffix('.').unwrap_or(name);
    let start = out.len();

    if !fqdn.is_empty() {
        for label in fqdn.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(ProbeError::Config(format!("invalid DNS name: {:?}", name)));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);

    if out.len() - start > MAX_NAME_LEN {
        return Err(ProbeError::Config(format!("DNS name too long: {:?}", name)));
    }
    Ok(())
}

/// Parse the fixed header of a DNS response.
pub fn parse_dns_response(buf: &[u8]) -> Result<DnsResponseHeader, ProbeError> {
    if buf.len() < HEADER_LEN {
        return Err(ProbeError::Dns(format!("response too short: {} bytes", buf.len())));
    }

    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & 0x8000 == 0 {
        return Err(ProbeError::Dns("message is not a response".to_string()));
    }

    Ok(DnsResponseHeader {
        id: u16::from_be_bytes([buf[0], buf[1]]),
        rcode: (flags & 0x000F) as u8,
        truncated: flags & 0x0200 != 0,
        answer_count: u16::from_be_bytes([buf[6], buf[7]]),
    })
}

/// A response is only "up" when it answers the question.
pub fn ensure_answers(header: &DnsResponseHeader) -> Result<(), ProbeError> {
    if header.answer_count == 0 {
        return Err(ProbeError::NoAnswers { rcode: header.rcode });
    }
    Ok(())
}

/// Turn a query into a canned response with `answers` A records (test helper).
#[cfg(test)]
pub(crate) fn fake_response(query: &[u8], answers: u16) -> Vec<u8> {
    let mut resp = query.to_vec();
    resp[2] = 0x81; // QR, RD
    resp[3] = if answers == 0 { 0x83 } else { 0x80 }; // RA, NXDOMAIN when empty
    resp[6..8].copy_from_slice(&answers.to_be_bytes());
    for _ in 0..answers {
        resp.extend_from_slice(&[0xC0, 0x0C]); // pointer to question name
        resp.extend_from_slice(&1u16.to_be_bytes());
        resp.extend_from_slice(&1u16.to_be_bytes());
        resp.extend_from_slice(&300u32.to_be_bytes());
        resp.extend_from_slice(&4u16.to_be_bytes());
        resp.extend_from_slice(&[93, 184, 216, 34]);
    }
    resp
}

/// Loopback DNS server answering every query with `answers` records (test helper).
#[cfg(test)]
pub(crate) async fn spawn_fake_dns_server(answers: u16) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let resp = fake_response(&buf[..n], answers);
            let _ = socket.send_to(&resp, peer).await;
        }
    });
    addr
}
