//! Error types for chain construction, dialing and configuration.

use std::fmt;
use std::io;
use std::path::PathBuf;

use hopbridge_net::BridgeError;
use thiserror::Error;

/// Chain construction failures. All of them are fatal to the chain being
/// built and none are retried at build time.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The hop specifier does not resolve to a transport and address.
    #[error("unsupported protocol format {spec:?}")]
    Format { spec: String },

    /// No bridger is registered for the transport and there is no default.
    #[error("unsupported protocol {scheme:?}")]
    UnsupportedProtocol { scheme: String },

    /// The bridger for a hop failed to set it up.
    #[error("bridge {spec}: {source}")]
    Bridge {
        /// Hop specifier with credentials stripped.
        spec: String,
        #[source]
        source: BridgeError,
    },

    /// The last hop of a bind chain has no listen capability.
    #[error("the last proxy in the bind chain cannot listen")]
    ListenUnsupported,

    /// The chain has no proxy groups.
    #[error("chain has no proxy")]
    EmptyProxy,

    /// A hop group lists no addresses.
    #[error("hop group has no addresses")]
    EmptyGroup,

    /// Pipe mode could not reach its target.
    #[error("dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Every attempt of a multi-endpoint dial failed.
///
/// Travels inside an [`io::Error`] of kind `Other` so dialers keep a plain
/// `io::Result`; use [`AggregateDialError::from_io`] to get it back.
#[derive(Debug)]
pub struct AggregateDialError {
    /// One error per attempt, in attempt order.
    pub errors: Vec<io::Error>,
}

impl AggregateDialError {
    /// Recover the aggregate from an error returned by a dialer.
    pub fn from_io(err: &io::Error) -> Option<&Self> {
        err.get_ref()?.downcast_ref()
    }
}

impl fmt::Display for AggregateDialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("all addresses are failed")?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateDialError {}

impl From<AggregateDialError> for io::Error {
    fn from(err: AggregateDialError) -> Self {
        io::Error::other(err)
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{origin}: chain {index} has no proxy")]
    EmptyProxy { origin: String, index: usize },

    #[error("{origin}: chain {index} has an empty hop group")]
    EmptyGroup { origin: String, index: usize },
}

/// Whether an I/O error only says the connection went away.
///
/// These end tunnels and accept loops during normal operation and are not
/// worth reporting.
pub fn is_closed_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
