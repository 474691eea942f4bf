//! DNS-over-QUIC probe implementation (RFC 9250).
//!
//! Each probe opens a fresh QUIC connection, sends one query on one
//! bidirectional stream and tears everything down again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Endpoint, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::dns::{build_dns_query, ensure_answers, parse_dns_response};
use super::{resolve_socket_addr, ProbeError};

const DOQ_ALPN: &[u8] = b"doq";
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE: usize = 64 * 1024;

/// Run a DNS-over-QUIC probe against `server:port`.
///
/// `verify_tls` controls server certificate validation. Returns latency of
/// the whole exchange, handshake included.
pub async fn run_doq_probe(
    server: &str,
    port: u16,
    name: &str,
    qtype: u16,
    verify_tls: bool,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    tokio::time::timeout(timeout, exchange_quic(server, port, name, qtype, verify_tls))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn exchange_quic(
    server: &str,
    port: u16,
    name: &str,
    qtype: u16,
    verify_tls: bool,
) -> Result<Duration, ProbeError> {
    // DoQ requires a zero message id; the stream identifies the exchange.
    let query = build_dns_query(0, name, qtype)?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);

    let server_addr = resolve_socket_addr(server, port).await?;
    let client_config = client_config(verify_tls)?;

    let bind_addr: SocketAddr = if server_addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let endpoint = Endpoint::client(bind_addr)
        .map_err(|e| ProbeError::Network(format!("failed to create QUIC endpoint: {}", e)))?;

    let start = Instant::now();
    let result = query_over_connection(&endpoint, client_config, server_addr, server, &framed).await;
    let elapsed = start.elapsed();

    endpoint.close(0u32.into(), b"");

    let response = result?;
    let header = parse_dns_response(strip_length_prefix(&response))?;
    ensure_answers(&header)?;

    Ok(elapsed)
}

async fn query_over_connection(
    endpoint: &Endpoint,
    config: ClientConfig,
    server_addr: SocketAddr,
    server_name: &str,
    framed: &[u8],
) -> Result<Vec<u8>, ProbeError> {
    let connection = endpoint
        .connect_with(config, server_addr, server_name)
        .map_err(|e| ProbeError::Network(format!("failed to dial QUIC server: {}", e)))?
        .await
        .map_err(|e| ProbeError::Network(format!("QUIC handshake failed: {}", e)))?;

    let result = async {
        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| ProbeError::Network(format!("failed to open QUIC stream: {}", e)))?;

        send.write_all(framed)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to write DNS message: {}", e)))?;
        send.finish()
            .map_err(|e| ProbeError::Network(format!("failed to finish QUIC stream: {}", e)))?;

        recv.read_to_end(MAX_RESPONSE + 2)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to read DNS response: {}", e)))
    }
    .await;

    connection.close(0u32.into(), b"");
    result
}

/// Strip the 2-octet length prefix when it matches the payload.
///
/// Some older servers reply with a bare message, which is passed through.
pub fn strip_length_prefix(buf: &[u8]) -> &[u8] {
    if buf.len() >= 2 {
        let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if declared == buf.len() - 2 {
            return &buf[2..];
        }
    }
    buf
}

fn client_config(verify_tls: bool) -> Result<ClientConfig, ProbeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProbeError::Config(format!("TLS setup failed: {}", e)))?;

    let mut crypto = if verify_tls {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    };
    crypto.alpn_protocols = vec![DOQ_ALPN.to_vec()];

    let quic_crypto = QuicClientConfig::try_from(crypto)
        .map_err(|e| ProbeError::Config(format!("QUIC TLS setup failed: {}", e)))?;

    let mut transport = TransportConfig::default();
    let idle: quinn::IdleTimeout = IDLE_TIMEOUT
        .try_into()
        .map_err(|e| ProbeError::Config(format!("invalid idle timeout: {}", e)))?;
    transport.max_idle_timeout(Some(idle));

    let mut config = ClientConfig::new(Arc::new(quic_crypto));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Loopback DoQ server with a self-signed certificate (test helper).
///
/// Every query is answered with `answers` records, with or without the
/// 2-octet length prefix.
#[cfg(test)]
pub(crate) async fn spawn_fake_doq_server(answers: u16, prefixed: bool) -> SocketAddr {
    use quinn::crypto::rustls::QuicServerConfig;
    use rustls::pki_types::PrivateKeyDer;

    use super::dns::fake_response;

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    tls.alpn_protocols = vec![DOQ_ALPN.to_vec()];

    let server_config =
        quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(tls).unwrap()));
    let endpoint = Endpoint::server(server_config, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    let addr = endpoint.local_addr().unwrap();

    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            let Ok(connection) = incoming.await else {
                continue;
            };
            tokio::spawn(async move {
                while let Ok((mut send, mut recv)) = connection.accept_bi().await {
                    let Ok(request) = recv.read_to_end(MAX_RESPONSE + 2).await else {
                        break;
                    };
                    let query = strip_length_prefix(&request);
                    let reply = fake_response(query, answers);
                    let mut out = Vec::with_capacity(reply.len() + 2);
                    if prefixed {
                        out.extend_from_slice(&(reply.len() as u16).to_be_bytes());
                    }
                    out.extend_from_slice(&reply);
                    if send.write_all(&out).await.is_err() || send.finish().is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_length_prefix() {
        let msg = [0xAB, 0xCD, 0x81, 0x80];
        let mut framed = vec![0x00, 0x04];
        framed.extend_from_slice(&msg);

        assert_eq!(strip_length_prefix(&framed), &msg);
        assert_eq!(strip_length_prefix(&msg), &msg);
        assert_eq!(strip_length_prefix(&[0x01]), &[0x01]);
    }

    #[test]
    fn test_client_config_builds_both_ways() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }

    #[tokio::test]
    async fn test_doq_probe_answered_is_up() {
        let server = spawn_fake_doq_server(1, true).await;

        let latency = run_doq_probe(
            "127.0.0.1",
            server.port(),
            "example.com",
            1,
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(latency > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_doq_probe_accepts_unprefixed_reply() {
        let server = spawn_fake_doq_server(2, false).await;

        let result = run_doq_probe(
            "127.0.0.1",
            server.port(),
            "example.com",
            28,
            false,
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_ok(), "unexpected error: {:?}", result);
    }

    #[tokio::test]
    async fn test_doq_probe_without_answers_is_down() {
        let server = spawn_fake_doq_server(0, true).await;

        let result = run_doq_probe(
            "127.0.0.1",
            server.port(),
            "missing.example",
            1,
            false,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::NoAnswers { rcode: 3 })));
    }

    #[tokio::test]
    async fn test_doq_probe_verified_rejects_self_signed() {
        let server = spawn_fake_doq_server(1, true).await;

        let result = run_doq_probe(
            "127.0.0.1",
            server.port(),
            "example.com",
            1,
            true,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::Network(_))));
    }

    #[tokio::test]
    async fn test_doq_probe_unreachable() {
        // Nobody speaks QUIC on this port; the probe must fail within its deadline.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let result = run_doq_probe(
            "127.0.0.1",
            port,
            "example.com",
            1,
            false,
            Duration::from_millis(500),
        )
        .await;
        assert!(result.is_err());
        drop(silent);
    }
}
