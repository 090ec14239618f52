//! Target addresses as SOCKS carries them.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hopbridge_net::{join_host_port, split_host_port};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub(crate) fn parse(address: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::Target(address.to_string());
        let (host, port) = split_host_port(address).ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::Ip(SocketAddr::new(ip, port)));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(invalid());
        }
        Ok(Self::Domain(host.to_string(), port))
    }

    /// Resolve a domain on this side of the proxy.
    pub(crate) async fn resolve(self) -> io::Result<SocketAddr> {
        match self {
            Self::Ip(addr) => Ok(addr),
            Self::Domain(host, port) => tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {host}"),
                    )
                }),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    pub(crate) fn write_socks5(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Self::Domain(host, _) => {
                buf.push(ATYP_DOMAIN);
                // parse() bounds the length
                buf.push(host.len() as u8);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }

    /// Read `addr` and `port` of a SOCKS5 request or reply after the type byte.
    pub(crate) async fn read_socks5<R>(reader: &mut R, atyp: u8) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let addr = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Self::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Self::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut host = vec![0u8; len];
                reader.read_exact(&mut host).await?;
                let port = reader.read_u16().await?;
                let host = String::from_utf8(host).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "socks5 domain is not utf-8")
                })?;
                Self::Domain(host, port)
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown socks5 address type {other:#04x}"),
                ))
            }
        };
        Ok(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => f.write_str(&join_host_port(host, &port.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert_eq!(
            TargetAddr::parse("127.0.0.1:80").unwrap(),
            TargetAddr::Ip("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse("[::1]:443").unwrap(),
            TargetAddr::Ip("[::1]:443".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse("example.com:8080").unwrap(),
            TargetAddr::Domain("example.com".into(), 8080)
        );
        assert!(TargetAddr::parse("example.com").is_err());
        assert!(TargetAddr::parse(":80").is_err());
        assert!(TargetAddr::parse("host:99999").is_err());
    }

    #[tokio::test]
    async fn test_socks5_encoding_reads_back() {
        for target in ["10.1.2.3:22", "[2001:db8::1]:8443", "proxy.internal:1080"] {
            let addr = TargetAddr::parse(target).unwrap();
            let mut buf = Vec::new();
            addr.write_socks5(&mut buf);
            let mut reader = &buf[1..];
            let decoded = TargetAddr::read_socks5(&mut reader, buf[0]).await.unwrap();
            assert_eq!(decoded, addr);
            assert_eq!(decoded.to_string(), target);
        }
    }
}
