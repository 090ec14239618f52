//! Protocol demultiplexing for proxy-server mode.
//!
//! One socket can serve SOCKS4, SOCKS5 and HTTP proxy clients at once. The
//! first byte picks the handler (`0x04`, `0x05`, anything else is HTTP) and
//! is pushed back so the handler reads the connection from the start.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use hopbridge_net::{resolve, BoxedStream, Hop, HopUri, Negotiated, ProxyHandler, UnreadStream};
use hopbridge_protocols::{Credentials, HttpServer, Socks4Server, Socks5Server};
use tracing::{debug, warn};

use crate::chain::redact_spec;
use crate::error::ChainError;
use crate::supervisor::ConnectionHandler;
use crate::tunnel::Tunnel;

/// Proxy protocol spoken by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Socks4,
    Socks5,
    Http,
}

impl Protocol {
    /// Classify a connection by its first byte.
    pub fn sniff(first: u8) -> Self {
        match first {
            0x04 => Self::Socks4,
            0x05 => Self::Socks5,
            _ => Self::Http,
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "socks4" | "socks4a" => Some(Self::Socks4),
            "socks5" | "socks5h" => Some(Self::Socks5),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Http => "http",
        })
    }
}

/// Routes accepted connections to the proxy handler their first byte asks
/// for, then tunnels the negotiated pair.
#[derive(Clone, Default)]
pub struct Demultiplexer {
    socks4: Option<Arc<dyn ProxyHandler>>,
    socks5: Option<Arc<dyn ProxyHandler>>,
    http: Option<Arc<dyn ProxyHandler>>,
    tunnel: Tunnel,
}

impl Demultiplexer {
    pub fn new(tunnel: Tunnel) -> Self {
        Self {
            tunnel,
            ..Default::default()
        }
    }

    /// Serve `protocol` with `handler`, replacing any previous handler.
    pub fn with_handler(mut self, protocol: Protocol, handler: Arc<dyn ProxyHandler>) -> Self {
        *self.slot(protocol) = Some(handler);
        self
    }

    /// Serve all three protocols without authentication.
    pub fn with_all(self, dialer: &Hop) -> Self {
        self.with_handler(Protocol::Socks4, Arc::new(Socks4Server::new(dialer.clone())))
            .with_handler(Protocol::Socks5, Arc::new(Socks5Server::new(dialer.clone())))
            .with_handler(Protocol::Http, Arc::new(HttpServer::new(dialer.clone())))
    }

    fn slot(&mut self, protocol: Protocol) -> &mut Option<Arc<dyn ProxyHandler>> {
        match protocol {
            Protocol::Socks4 => &mut self.socks4,
            Protocol::Socks5 => &mut self.socks5,
            Protocol::Http => &mut self.http,
        }
    }

    fn handler(&self, protocol: Protocol) -> Option<&Arc<dyn ProxyHandler>> {
        match protocol {
            Protocol::Socks4 => self.socks4.as_ref(),
            Protocol::Socks5 => self.socks5.as_ref(),
            Protocol::Http => self.http.as_ref(),
        }
    }

    /// Enabled protocols.
    pub fn protocols(&self) -> Vec<Protocol> {
        [Protocol::Socks4, Protocol::Socks5, Protocol::Http]
            .into_iter()
            .filter(|protocol| self.handler(*protocol).is_some())
            .collect()
    }

    /// Sniff `conn` and run the matching handshake.
    ///
    /// `Ok(None)` means there is nothing to tunnel: the client left before
    /// sending anything, or the handler answered it directly.
    pub async fn dispatch(&self, conn: BoxedStream) -> io::Result<Option<Negotiated>> {
        let mut conn = UnreadStream::new(conn);
        let Some(&first) = conn.peek(1).await?.first() else {
            return Ok(None);
        };
        let protocol = Protocol::sniff(first);
        let handler = self.handler(protocol).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{protocol} is not served on this listener"),
            )
        })?;
        debug!(%protocol, "sniffed");
        handler.negotiate(Box::new(conn)).await
    }
}

impl fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("protocols", &self.protocols())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionHandler for Demultiplexer {
    async fn handle(&self, conn: BoxedStream, _peer: &str) -> io::Result<()> {
        let Some(negotiated) = self.dispatch(conn).await? else {
            return Ok(());
        };
        debug!(target = %negotiated.target, "proxying");
        let stats = self.tunnel.run(negotiated.client, negotiated.upstream).await?;
        debug!(
            target = %negotiated.target,
            sent = stats.sent,
            received = stats.received,
            "tunnel closed"
        );
        Ok(())
    }
}

/// Group proxy-server listen specifiers by listen address.
///
/// `socks5://u:p@:1080` enables SOCKS5 (with credentials) on `:1080`; a plain
/// address such as `:1080` enables every protocol. Addresses are returned in
/// order of first appearance.
pub fn plan_listeners(
    specs: &[String],
    dialer: &Hop,
    tunnel: &Tunnel,
) -> Result<Vec<(String, Demultiplexer)>, ChainError> {
    let mut plan: Vec<(String, Demultiplexer)> = Vec::new();
    for spec in specs {
        let endpoint = resolve(spec).ok_or_else(|| ChainError::Format {
            spec: redact_spec(spec),
        })?;
        let index = match plan.iter().position(|(address, _)| *address == endpoint.address) {
            Some(index) => index,
            None => {
                plan.push((endpoint.address.clone(), Demultiplexer::new(tunnel.clone())));
                plan.len() - 1
            }
        };
        let demux = &mut plan[index].1;

        if endpoint.transport == "tcp" {
            *demux = std::mem::take(demux).with_all(dialer);
            continue;
        }
        let protocol = Protocol::from_scheme(&endpoint.transport).ok_or_else(|| {
            ChainError::UnsupportedProtocol {
                scheme: endpoint.transport.clone(),
            }
        })?;
        let credentials = HopUri::parse(spec)
            .as_ref()
            .and_then(Credentials::from_uri);
        let handler: Arc<dyn ProxyHandler> = match protocol {
            Protocol::Socks4 => Arc::new(
                Socks4Server::new(dialer.clone()).with_user_id(credentials.map(|c| c.username)),
            ),
            Protocol::Socks5 => {
                Arc::new(Socks5Server::new(dialer.clone()).with_credentials(credentials))
            }
            Protocol::Http => Arc::new(HttpServer::new(dialer.clone()).with_credentials(credentials)),
        };
        if demux.handler(protocol).is_some() {
            warn!(hop = %redact_spec(spec), %protocol, "protocol listed twice, last one wins");
        }
        *demux = std::mem::take(demux).with_handler(protocol, handler);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    /// Records the full byte stream each protocol's handler sees.
    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<(Protocol, Vec<u8>)>>,
    }

    struct CaptureHandler {
        protocol: Protocol,
        capture: Arc<Capture>,
    }

    #[async_trait]
    impl ProxyHandler for CaptureHandler {
        async fn negotiate(&self, mut conn: BoxedStream) -> io::Result<Option<Negotiated>> {
            let mut bytes = Vec::new();
            conn.read_to_end(&mut bytes).await?;
            self.capture
                .seen
                .lock()
                .unwrap()
                .push((self.protocol, bytes));
            Ok(None)
        }
    }

    fn capturing() -> (Demultiplexer, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let mut demux = Demultiplexer::default();
        for protocol in [Protocol::Socks4, Protocol::Socks5, Protocol::Http] {
            demux = demux.with_handler(
                protocol,
                Arc::new(CaptureHandler {
                    protocol,
                    capture: capture.clone(),
                }),
            );
        }
        (demux, capture)
    }

    #[tokio::test]
    async fn test_first_byte_routes_with_stream_intact() {
        let cases: [(&[u8], Protocol); 3] = [
            (b"\x04\x01\x00\x50\x7f\x00\x00\x01\x00", Protocol::Socks4),
            (b"\x05\x01\x00", Protocol::Socks5),
            (b"CONNECT example.com:443 HTTP/1.1\r\n\r\n", Protocol::Http),
        ];
        let (demux, capture) = capturing();
        for (bytes, _) in cases {
            // split reads so the sniffed byte and the rest arrive separately
            let conn = Builder::new().read(&bytes[..1]).read(&bytes[1..]).build();
            assert!(demux.dispatch(Box::new(conn)).await.unwrap().is_none());
        }

        let seen = capture.seen.lock().unwrap();
        for ((bytes, protocol), (got_protocol, got_bytes)) in cases.iter().zip(seen.iter()) {
            assert_eq!(got_protocol, protocol);
            assert_eq!(got_bytes.as_slice(), *bytes);
        }
    }

    #[tokio::test]
    async fn test_disabled_protocol_is_refused() {
        let (demux, _) = capturing();
        let demux = Demultiplexer {
            socks4: None,
            ..demux
        };
        let conn = Builder::new().read(b"\x04").build();
        let err = demux.dispatch(Box::new(conn)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_silent_client_is_ignored() {
        let (demux, capture) = capturing();
        let conn = Builder::new().build();
        assert!(demux.dispatch(Box::new(conn)).await.unwrap().is_none());
        assert!(capture.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_plan_groups_by_address() {
        let specs: Vec<String> = [
            "http://:8080",
            "socks5://u:p@:1080",
            "socks4://:1080",
            ":9000",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let plan = plan_listeners(&specs, &hopbridge_protocols::local(), &Tunnel::default())
            .unwrap();

        let summary: Vec<_> = plan
            .iter()
            .map(|(address, demux)| (address.as_str(), demux.protocols()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (":8080", vec![Protocol::Http]),
                (":1080", vec![Protocol::Socks4, Protocol::Socks5]),
                (
                    ":9000",
                    vec![Protocol::Socks4, Protocol::Socks5, Protocol::Http]
                ),
            ]
        );
    }

    #[test]
    fn test_plan_rejects_unknown_scheme() {
        let err = plan_listeners(
            &["ssh://:2222".to_string()],
            &hopbridge_protocols::local(),
            &Tunnel::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::UnsupportedProtocol { .. }));
    }
}
