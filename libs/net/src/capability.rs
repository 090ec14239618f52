//! Capability traits and the tagged capability set produced by each hop.
//!
//! A hop always knows how to dial. Listening and executing commands are
//! optional and carried as explicit fields on [`Hop`], so callers check a
//! field instead of probing a trait object at runtime.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::split_command;
use crate::stream::BoxedStream;

/// Errors produced while bridging through a hop.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The hop address could not be interpreted by the plugin.
    #[error("invalid hop address {0:?}")]
    InvalidAddress(String),

    /// The upstream lacks a capability this hop depends on.
    #[error("{scheme} hop requires an upstream that can {capability}")]
    MissingCapability {
        scheme: String,
        capability: &'static str,
    },

    /// The plugin does not support the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O failure while setting up the hop.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Opens connections to `(network, address)`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream>;
}

/// An accepting socket produced by a [`ListenConfig`].
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection. Returns the stream and a printable peer address.
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;

    /// Printable local address.
    fn local_addr(&self) -> String;
}

/// Boxed listener.
pub type BoxedListener = Box<dyn Listener>;

/// Opens listening sockets on `(network, address)`.
#[async_trait]
pub trait ListenConfig: Send + Sync {
    async fn listen(&self, network: &str, address: &str) -> io::Result<BoxedListener>;
}

/// Runs a command and exposes its stdio as a connection.
#[async_trait]
pub trait CommandDialer: Send + Sync {
    async fn command_dial(&self, name: &str, args: &[String]) -> io::Result<BoxedStream>;
}

/// A proxy request that has been negotiated and dialed, ready to tunnel.
pub struct Negotiated {
    /// The accepting side, positioned after the handshake.
    pub client: BoxedStream,
    /// The connection dialed on the client's behalf.
    pub upstream: BoxedStream,
    /// Requested target, for logging.
    pub target: String,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Serves the handshake of one accepted connection as a proxy server
/// (SOCKS4, SOCKS5, HTTP).
///
/// Returns `Ok(None)` when the handler answered the client itself (auth
/// rejected, unsupported command) and there is nothing to tunnel.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn negotiate(&self, conn: BoxedStream) -> io::Result<Option<Negotiated>>;
}

/// The capabilities a hop exposes after bridging.
#[derive(Clone)]
pub struct Hop {
    /// Always present.
    pub dialer: Arc<dyn Dialer>,
    /// Present when connections can be accepted through this hop.
    pub listen: Option<Arc<dyn ListenConfig>>,
    /// Present when commands can be executed at this hop.
    pub command: Option<Arc<dyn CommandDialer>>,
}

impl Hop {
    /// A hop that can only dial.
    pub fn dial_only(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            listen: None,
            command: None,
        }
    }

    /// Attach a listen capability.
    pub fn with_listen(mut self, listen: Arc<dyn ListenConfig>) -> Self {
        self.listen = Some(listen);
        self
    }

    /// Attach a command capability.
    pub fn with_command(mut self, command: Arc<dyn CommandDialer>) -> Self {
        self.command = Some(command);
        self
    }

    /// Dial through this hop.
    ///
    /// `cmd`/`command` networks run the address as a command line through the
    /// command capability; everything else goes to the dialer.
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        if is_command_network(network) {
            let command = self.command.as_ref().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("protocol {network:?} unsupported cmd {address:?}"),
                )
            })?;
            let argv = split_command(address)?;
            let (name, args) = argv
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
            return command.command_dial(name, args).await;
        }
        self.dialer.dial(network, address).await
    }

    /// Listen through this hop, if it supports listening.
    pub async fn listen(&self, network: &str, address: &str) -> io::Result<BoxedListener> {
        let listen = self.listen.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "hop cannot listen")
        })?;
        if is_command_network(network) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("protocol {network:?} unsupported listen {address:?}"),
            ));
        }
        listen.listen(network, address).await
    }
}

impl fmt::Debug for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hop")
            .field("listen", &self.listen.is_some())
            .field("command", &self.command.is_some())
            .finish_non_exhaustive()
    }
}

/// Turns an upstream hop plus a hop specifier into a new hop tunneling through it.
///
/// `address` is the full hop specifier (`socks5://user:pw@host:1080`), so the
/// plugin can read credentials and query options.
#[async_trait]
pub trait Bridger: Send + Sync {
    async fn bridge(&self, upstream: Hop, address: &str) -> Result<Hop, BridgeError>;
}

fn is_command_network(network: &str) -> bool {
    network == "cmd" || network == "command"
}
