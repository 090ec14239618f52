//! SOCKS4 and SOCKS4a CONNECT client and server.
//!
//! `socks4://` resolves target names to IPv4 on this side; `socks4a://`
//! sends them to the proxy.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hopbridge_net::{
    join_host_port, BoxedStream, BridgeError, Bridger, Dialer, Hop, HopUri, Negotiated,
    ProxyHandler,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::addr::TargetAddr;
use crate::error::ProtocolError;

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const REPLY_VERSION: u8 = 0x00;
const GRANTED: u8 = 0x5a;
const REJECTED: u8 = 0x5b;
const USER_MISMATCH: u8 = 0x5d;

const MAX_FIELD: usize = 255;

/// Bridger for `socks4://[user@]host:port` and `socks4a://...`.
pub struct Socks4Bridger;

#[async_trait]
impl Bridger for Socks4Bridger {
    async fn bridge(&self, upstream: Hop, address: &str) -> Result<Hop, BridgeError> {
        let uri =
            HopUri::parse(address).ok_or_else(|| BridgeError::InvalidAddress(address.into()))?;
        if uri.host.is_empty() {
            return Err(BridgeError::InvalidAddress(address.into()));
        }
        Ok(Hop::dial_only(Arc::new(Socks4Dialer {
            upstream,
            user_id: uri.username.unwrap_or_default(),
            remote_resolve: uri.scheme == "socks4a",
            proxy: uri.host,
        })))
    }
}

struct Socks4Dialer {
    upstream: Hop,
    proxy: String,
    user_id: String,
    remote_resolve: bool,
}

#[async_trait]
impl Dialer for Socks4Dialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        if !network.starts_with("tcp") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("socks4 cannot dial network {network:?}"),
            ));
        }
        let target = TargetAddr::parse(address)?;
        let port = target.port();

        let mut request = vec![VERSION, CMD_CONNECT];
        request.extend_from_slice(&port.to_be_bytes());
        let domain = match target {
            TargetAddr::Domain(host, _) if self.remote_resolve => {
                // 0.0.0.x marks a socks4a request
                request.extend_from_slice(&[0, 0, 0, 1]);
                Some(host)
            }
            target => match target.resolve().await? {
                SocketAddr::V4(addr) => {
                    request.extend_from_slice(&addr.ip().octets());
                    None
                }
                SocketAddr::V6(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("socks4 cannot reach IPv6 target {address}"),
                    ))
                }
            },
        };
        request.extend_from_slice(self.user_id.as_bytes());
        request.push(0);
        if let Some(domain) = domain {
            request.extend_from_slice(domain.as_bytes());
            request.push(0);
        }

        let mut conn = self.upstream.dial("tcp", &self.proxy).await?;
        conn.write_all(&request).await?;

        let mut reply = [0u8; 8];
        conn.read_exact(&mut reply).await?;
        if reply[0] != REPLY_VERSION {
            return Err(ProtocolError::Version {
                protocol: "socks4 reply",
                version: reply[0],
            }
            .into());
        }
        if reply[1] != GRANTED {
            return Err(ProtocolError::Socks4Rejected(reply[1]).into());
        }
        debug!(proxy = %self.proxy, target = address, "socks4 connected");
        Ok(conn)
    }
}

/// SOCKS4/4a CONNECT server dialing through a hop.
pub struct Socks4Server {
    dialer: Hop,
    user_id: Option<String>,
}

impl Socks4Server {
    pub fn new(dialer: Hop) -> Self {
        Self {
            dialer,
            user_id: None,
        }
    }

    /// Only accept requests carrying this user id.
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

async fn reply(conn: &mut BoxedStream, code: u8) -> io::Result<()> {
    conn.write_all(&[REPLY_VERSION, code, 0, 0, 0, 0, 0, 0]).await
}

#[async_trait]
impl ProxyHandler for Socks4Server {
    async fn negotiate(&self, mut conn: BoxedStream) -> io::Result<Option<Negotiated>> {
        let mut head = [0u8; 8];
        conn.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(ProtocolError::Version {
                protocol: "socks4",
                version: head[0],
            }
            .into());
        }
        let port = u16::from_be_bytes([head[2], head[3]]);
        let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);
        let user_id = read_null_terminated(&mut conn).await?;

        let host = match ip.octets() {
            [0, 0, 0, x] if x != 0 => read_null_terminated(&mut conn).await?,
            _ => ip.to_string(),
        };

        if head[1] != CMD_CONNECT {
            reply(&mut conn, REJECTED).await?;
            return Ok(None);
        }
        if let Some(expected) = &self.user_id {
            if &user_id != expected {
                reply(&mut conn, USER_MISMATCH).await?;
                debug!(user_id = %user_id, "socks4 user id rejected");
                return Ok(None);
            }
        }

        let target = join_host_port(&host, &port.to_string());
        let upstream = match self.dialer.dial("tcp", &target).await {
            Ok(upstream) => upstream,
            Err(err) => {
                reply(&mut conn, REJECTED).await?;
                return Err(err);
            }
        };
        reply(&mut conn, GRANTED).await?;
        Ok(Some(Negotiated {
            client: conn,
            upstream,
            target,
        }))
    }
}

async fn read_null_terminated<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut field = Vec::new();
    loop {
        match reader.read_u8().await? {
            0 => break,
            byte if field.len() < MAX_FIELD => field.push(byte),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "socks4 field is not terminated",
                ))
            }
        }
    }
    Ok(String::from_utf8_lossy(&field).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{echo, served_by, EchoDialer};

    #[tokio::test]
    async fn test_socks4a_sends_domain() {
        let exits = Arc::new(EchoDialer::default());
        let server = Socks4Server::new(Hop::dial_only(exits.clone()));
        let hop = Socks4Bridger
            .bridge(served_by(server), "socks4a://proxy:1080")
            .await
            .unwrap();

        let mut conn = hop.dial("tcp", "intranet.local:8080").await.unwrap();
        assert_eq!(echo(&mut conn, b"abc").await, b"abc");
        assert_eq!(*exits.targets.lock().unwrap(), vec!["intranet.local:8080"]);
    }

    #[tokio::test]
    async fn test_socks4_with_ip_and_user_id() {
        let exits = Arc::new(EchoDialer::default());
        let server =
            Socks4Server::new(Hop::dial_only(exits.clone())).with_user_id(Some("bob".into()));
        let hop = Socks4Bridger
            .bridge(served_by(server), "socks4://bob@proxy:1080")
            .await
            .unwrap();

        let mut conn = hop.dial("tcp", "192.168.1.9:22").await.unwrap();
        assert_eq!(echo(&mut conn, b"x").await, b"x");
        assert_eq!(*exits.targets.lock().unwrap(), vec!["192.168.1.9:22"]);
    }

    #[tokio::test]
    async fn test_wrong_user_id_is_rejected() {
        let exits = Arc::new(EchoDialer::default());
        let server =
            Socks4Server::new(Hop::dial_only(exits.clone())).with_user_id(Some("bob".into()));
        let hop = Socks4Bridger
            .bridge(served_by(server), "socks4://eve@proxy:1080")
            .await
            .unwrap();

        let err = hop.dial("tcp", "192.168.1.9:22").await.err().unwrap();
        assert!(err.to_string().contains("0x5d"), "{err}");
        assert!(exits.targets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_target_needs_socks5() {
        let hop = Socks4Bridger
            .bridge(Hop::dial_only(Arc::new(EchoDialer::default())), "socks4://proxy:1080")
            .await
            .unwrap();
        let err = hop.dial("tcp", "[::1]:80").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
