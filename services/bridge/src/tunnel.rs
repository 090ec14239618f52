//! Bidirectional copy between two established connections.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::is_closed_error;
use crate::idle::{Activity, IdleStream};
use crate::pool::BufferPool;

/// Bytes moved by one tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client to upstream.
    pub sent: u64,
    /// Upstream to client.
    pub received: u64,
}

/// Copies bytes both ways with pooled buffers.
///
/// The tunnel ends as soon as either direction finishes; both connections are
/// then shut down and dropped. The other direction is cancelled, and errors
/// from closing the two ends are logged rather than returned.
#[derive(Debug, Clone, Default)]
pub struct Tunnel {
    pool: BufferPool,
    idle_timeout: Option<Duration>,
}

impl Tunnel {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            idle_timeout: None,
        }
    }

    /// Close tunnels nothing moved through for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Run until either side closes. Expected disconnects are not errors.
    pub async fn run<A, B>(&self, client: A, upstream: B) -> io::Result<TunnelStats>
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let activity = Activity::new();
        let (mut client_rd, mut client_wr) =
            tokio::io::split(IdleStream::new(client, activity.clone()));
        let (mut upstream_rd, mut upstream_wr) =
            tokio::io::split(IdleStream::new(upstream, activity.clone()));
        let mut up_buf = self.pool.get();
        let mut down_buf = self.pool.get();
        let mut stats = TunnelStats::default();

        let (finished, result) = {
            let up = copy_half(&mut client_rd, &mut upstream_wr, &mut up_buf, &mut stats.sent);
            let down = copy_half(
                &mut upstream_rd,
                &mut client_wr,
                &mut down_buf,
                &mut stats.received,
            );
            let idle = async {
                match self.idle_timeout {
                    Some(timeout) => activity.expired(timeout).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                result = up => ("upstream", result),
                result = down => ("downstream", result),
                err = idle => ("idle", Err(err)),
            }
        };

        // the unfinished direction is cancelled; close both ends
        if let Err(err) = client_wr.shutdown().await {
            debug!(error = %err, finished, "closing client failed");
        }
        if let Err(err) = upstream_wr.shutdown().await {
            debug!(error = %err, finished, "closing upstream failed");
        }

        match result {
            Err(err) if !is_closed_error(&err) => Err(err),
            Err(err) => {
                debug!(error = %err, finished, "tunnel closed");
                Ok(stats)
            }
            Ok(()) => Ok(stats),
        }
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
