//! Type-erased byte streams.

use tokio::io::{AsyncRead, AsyncWrite};

/// Combined trait for async read + write + unpin + send.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed connection handed between hops, tunnels and handlers.
pub type BoxedStream = Box<dyn AsyncStream>;
