//! Wire-level protocol failures.

use std::io;

use thiserror::Error;

/// A proxy peer answered with something we cannot use.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected {protocol} version {version:#04x}")]
    Version { protocol: &'static str, version: u8 },

    #[error("socks5 server accepted none of the offered auth methods")]
    NoAcceptableAuth,

    #[error("socks5 authentication rejected")]
    AuthRejected,

    #[error("socks5 request failed: {0}")]
    Socks5Reply(&'static str),

    #[error("socks4 request rejected with code {0:#04x}")]
    Socks4Rejected(u8),

    #[error("http proxy answered {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("malformed http message: {0}")]
    Http(#[from] httparse::Error),

    #[error("http header section larger than {0} bytes")]
    HeaderTooLarge(usize),

    #[error("invalid target address {0:?}")]
    Target(String),
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        let kind = match err {
            ProtocolError::AuthRejected | ProtocolError::NoAcceptableAuth => {
                io::ErrorKind::PermissionDenied
            }
            ProtocolError::Target(_) => io::ErrorKind::InvalidInput,
            ProtocolError::Socks5Reply("connection refused") => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
