//! HTTP proxy: `CONNECT` client, and a server that answers `CONNECT` and
//! forwards plain absolute-URI requests.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hopbridge_net::{
    BoxedStream, BridgeError, Bridger, Dialer, Hop, HopUri, Negotiated, ProxyHandler,
    UnreadStream,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::ProtocolError;
use crate::socks5::Credentials;

const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Hop-by-hop headers dropped when forwarding.
const HOP_HEADERS: &[&str] = &[
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

/// Bridger for `http://[user:pass@]host:port`.
pub struct HttpBridger;

#[async_trait]
impl Bridger for HttpBridger {
    async fn bridge(&self, upstream: Hop, address: &str) -> Result<Hop, BridgeError> {
        let uri =
            HopUri::parse(address).ok_or_else(|| BridgeError::InvalidAddress(address.into()))?;
        if uri.host.is_empty() {
            return Err(BridgeError::InvalidAddress(address.into()));
        }
        Ok(Hop::dial_only(Arc::new(ConnectDialer {
            upstream,
            authorization: Credentials::from_uri(&uri).map(|c| basic_auth(&c)),
            proxy: uri.host,
        })))
    }
}

fn basic_auth(credentials: &Credentials) -> String {
    let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
    format!("Basic {token}")
}

struct ConnectDialer {
    upstream: Hop,
    proxy: String,
    authorization: Option<String>,
}

#[async_trait]
impl Dialer for ConnectDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        if !network.starts_with("tcp") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("http proxy cannot dial network {network:?}"),
            ));
        }
        let mut conn = self.upstream.dial("tcp", &self.proxy).await?;

        let mut request = format!("CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n");
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
        }
        request.push_str("\r\n");
        conn.write_all(request.as_bytes()).await?;

        let (buf, head_len) = read_head(&mut conn).await?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&buf[..head_len])
            .map_err(ProtocolError::from)?;
        let status = response.code.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(ProtocolError::HttpStatus {
                status,
                reason: response.reason.unwrap_or_default().to_string(),
            }
            .into());
        }
        debug!(proxy = %self.proxy, target = address, "http tunnel established");

        Ok(Box::new(UnreadStream::with_prefix(conn, &buf[head_len..])))
    }
}

/// Read until the end of an HTTP head. Returns everything read and the
/// length of the head; bytes past it belong to the body or the tunnel.
async fn read_head<R>(reader: &mut R) -> io::Result<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside http head",
            ));
        }
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf[scan_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok((buf, scan_from + pos + 4));
        }
        if buf.len() > MAX_HEAD {
            return Err(ProtocolError::HeaderTooLarge(MAX_HEAD).into());
        }
    }
}

struct Request {
    method: String,
    target: String,
    version: u8,
    headers: Vec<(String, Vec<u8>)>,
}

impl Request {
    fn parse(head: &[u8]) -> Result<Self, ProtocolError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        request.parse(head)?;
        Ok(Self {
            method: request.method.unwrap_or_default().to_string(),
            target: request.path.unwrap_or_default().to_string(),
            version: request.version.unwrap_or(1),
            headers: request
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        })
    }

    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Origin-form head for the upstream server, closing after one response.
    fn forward_head(&self, path: &str) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.{}\r\n", self.method, path, self.version).into_bytes();
        for (name, value) in &self.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value);
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"Connection: close\r\n\r\n");
        head
    }
}

/// Split `http://host[:port]/path` into a dial target and origin-form path.
fn absolute_target(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("http://")?;
    let (authority, path) = match rest.find(['/', '?']) {
        Some(i) => rest.split_at(i),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return None;
    }
    let path = if path.starts_with('?') {
        format!("/{path}")
    } else {
        path.to_string()
    };
    let has_port = match authority.rfind(':') {
        Some(i) => !authority[i..].contains(']'),
        None => false,
    };
    let target = if has_port {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };
    Some((target, path))
}

/// HTTP proxy server dialing through a hop.
pub struct HttpServer {
    dialer: Hop,
    authorization: Option<String>,
}

impl HttpServer {
    pub fn new(dialer: Hop) -> Self {
        Self {
            dialer,
            authorization: None,
        }
    }

    /// Require `Proxy-Authorization: Basic` with these credentials.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.authorization = credentials.map(|c| basic_auth(&c));
        self
    }
}

async fn respond(conn: &mut BoxedStream, status: &str, extra: &str) -> io::Result<()> {
    let response = format!("HTTP/1.1 {status}\r\n{extra}Content-Length: 0\r\n\r\n");
    conn.write_all(response.as_bytes()).await
}

#[async_trait]
impl ProxyHandler for HttpServer {
    async fn negotiate(&self, mut conn: BoxedStream) -> io::Result<Option<Negotiated>> {
        let (buf, head_len) = read_head(&mut conn).await?;
        let request = match Request::parse(&buf[..head_len]) {
            Ok(request) => request,
            Err(err) => {
                respond(&mut conn, "400 Bad Request", "").await?;
                return Err(err.into());
            }
        };

        if let Some(expected) = &self.authorization {
            if request.header("proxy-authorization") != Some(expected.as_bytes()) {
                respond(
                    &mut conn,
                    "407 Proxy Authentication Required",
                    "Proxy-Authenticate: Basic realm=\"proxy\"\r\n",
                )
                .await?;
                return Ok(None);
            }
        }

        if request.method.eq_ignore_ascii_case("CONNECT") {
            let target = request.target.clone();
            let upstream = match self.dialer.dial("tcp", &target).await {
                Ok(upstream) => upstream,
                Err(err) => {
                    respond(&mut conn, "502 Bad Gateway", "").await?;
                    return Err(err);
                }
            };
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            let client: BoxedStream = Box::new(UnreadStream::with_prefix(conn, &buf[head_len..]));
            return Ok(Some(Negotiated {
                client,
                upstream,
                target,
            }));
        }

        let Some((target, path)) = absolute_target(&request.target) else {
            respond(&mut conn, "400 Bad Request", "").await?;
            return Ok(None);
        };
        let mut upstream = match self.dialer.dial("tcp", &target).await {
            Ok(upstream) => upstream,
            Err(err) => {
                respond(&mut conn, "502 Bad Gateway", "").await?;
                return Err(err);
            }
        };
        upstream.write_all(&request.forward_head(&path)).await?;
        upstream.write_all(&buf[head_len..]).await?;
        Ok(Some(Negotiated {
            client: conn,
            upstream,
            target,
        }))
    }
}
