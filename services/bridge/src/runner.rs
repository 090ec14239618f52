//! Running one configured chain.
//!
//! A chain runs in one of three modes:
//! - pipe: no bind groups, stdin/stdout are tunneled to one dialed target
//! - forward: every accepted connection is tunneled to a target from `proxy[0]`
//! - proxy server: `proxy[0]` is `-`, accepted connections are sniffed and
//!   served as SOCKS4, SOCKS5 or HTTP proxy requests

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::join_all;
use hopbridge_net::{resolve, BoxedStream, Endpoint, Hop};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::chain::{describe_chain, redact_spec, ChainBuilder};
use crate::config::{ChainConfig, HopGroup};
use crate::demux::plan_listeners;
use crate::error::ChainError;
use crate::pool::BufferPool;
use crate::supervisor::{cancelled, BackoffPolicy, ConnectionHandler, ListenerSupervisor};
use crate::tunnel::Tunnel;

/// Tunnels each accepted connection to one of a fixed set of targets.
pub struct TargetHandler {
    dialer: Hop,
    targets: Vec<Endpoint>,
    tunnel: Tunnel,
}

impl TargetHandler {
    /// Fails if a target does not resolve.
    pub fn new(dialer: Hop, targets: &HopGroup, tunnel: Tunnel) -> Result<Self, ChainError> {
        let targets = resolve_targets(targets)?;
        Ok(Self {
            dialer,
            targets,
            tunnel,
        })
    }

    /// A target chosen uniformly at random.
    fn pick(&self) -> &Endpoint {
        pick(&self.targets)
    }
}

fn resolve_targets(group: &HopGroup) -> Result<Vec<Endpoint>, ChainError> {
    if group.lb.is_empty() {
        return Err(ChainError::EmptyGroup);
    }
    group
        .lb
        .iter()
        .map(|spec| {
            resolve(spec).ok_or_else(|| ChainError::Format {
                spec: redact_spec(spec),
            })
        })
        .collect()
}

fn pick(targets: &[Endpoint]) -> &Endpoint {
    &targets[rand::rng().random_range(0..targets.len())]
}

#[async_trait]
impl ConnectionHandler for TargetHandler {
    async fn handle(&self, conn: BoxedStream, _peer: &str) -> io::Result<()> {
        let target = self.pick();
        let upstream = self.dialer.dial(&target.transport, &target.address).await?;
        debug!(target = %target.address, "connected");
        let stats = self.tunnel.run(conn, upstream).await?;
        debug!(
            target = %target.address,
            sent = stats.sent,
            received = stats.received,
            "tunnel closed"
        );
        Ok(())
    }
}

/// The process's stdin and stdout as one stream.
pub struct StdioStream {
    stdin: Stdin,
    stdout: Stdout,
}

impl StdioStream {
    pub fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdioStream {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

/// Builds chains and runs them until shutdown.
#[derive(Debug, Clone)]
pub struct ChainRunner {
    builder: ChainBuilder,
    pool: BufferPool,
    backoff: BackoffPolicy,
}

impl ChainRunner {
    pub fn new(builder: ChainBuilder) -> Self {
        Self {
            builder,
            pool: BufferPool::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Share a buffer pool across chains.
    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build `chain` and serve it until `shutdown` fires.
    ///
    /// Build errors are returned right away. Once listening, listen and
    /// accept failures are retried and the call only returns on shutdown.
    pub async fn run(
        &self,
        chain: &ChainConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChainError> {
        let (targets, dial_groups) = chain.proxy.split_first().ok_or(ChainError::EmptyProxy)?;
        info!(chain = %describe_chain(chain), "starting chain");

        let dialer = self.builder.dial_chain(dial_groups).await?;
        let tunnel = Tunnel::new(self.pool.clone()).with_idle_timeout(chain.idle_timeout());

        let Some((listens, listen_groups)) = chain.bind.split_first() else {
            return self.pipe(dialer, targets, tunnel, shutdown).await;
        };
        let listen = self.builder.listen_chain(listen_groups).await?;

        let supervisors = if targets.is_sentinel() {
            plan_listeners(&listens.lb, &dialer, &tunnel)?
                .into_iter()
                .map(|(address, demux)| {
                    info!(listen = %address, protocols = ?demux.protocols(), "serving proxy");
                    ListenerSupervisor::new(listen.clone(), &[address], Arc::new(demux))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let handler = TargetHandler::new(dialer, targets, tunnel)?;
            vec![ListenerSupervisor::new(
                listen,
                &listens.lb,
                Arc::new(handler),
            )?]
        };

        join_all(
            supervisors
                .into_iter()
                .map(|supervisor| supervisor.with_backoff(self.backoff.clone()).run(shutdown.clone())),
        )
        .await;
        Ok(())
    }

    async fn pipe(
        &self,
        dialer: Hop,
        targets: &HopGroup,
        tunnel: Tunnel,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChainError> {
        if targets.is_sentinel() {
            return Err(ChainError::Format {
                spec: "-".to_string(),
            });
        }
        let targets = resolve_targets(targets)?;
        let target = pick(&targets);
        let dialed = tokio::select! {
            dialed = dialer.dial(&target.transport, &target.address) => dialed,
            _ = cancelled(&mut shutdown) => return Ok(()),
        };
        let upstream = dialed.map_err(|source| ChainError::Dial {
            target: target.address.clone(),
            source,
        })?;
        info!(target = %target.address, "piping stdio");

        tokio::select! {
            stats = tunnel.run(StdioStream::new(), upstream) => {
                let stats = stats?;
                debug!(sent = stats.sent, received = stats.received, "pipe closed");
            }
            _ = cancelled(&mut shutdown) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::registry::Registry;
    use crate::testing::Recorder;

    fn runner(recorder: &Recorder) -> ChainRunner {
        let mut registry = Registry::new();
        registry.register_default(recorder.bridger("rec"));
        ChainRunner::new(ChainBuilder::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_targets_are_picked_at_random() {
        let recorder = Recorder::new();
        let dialer = recorder
            .bridger("rec")
            .bridge(recorder.seed(), "relay:1")
            .await
            .unwrap();
        let handler =
            TargetHandler::new(dialer, &HopGroup::parse("a:1|b:1"), Tunnel::default()).unwrap();

        for _ in 0..64 {
            let (client, _peer) = tokio::io::duplex(64);
            handler.handle(Box::new(client), "test").await.unwrap();
        }
        let seen: HashSet<_> = recorder.dials().into_iter().collect();
        assert_eq!(
            seen,
            HashSet::from([
                "dial a:1 via relay:1".to_string(),
                "dial b:1 via relay:1".to_string(),
            ])
        );
    }

    #[test]
    fn test_unresolvable_target_is_rejected() {
        let result = TargetHandler::new(
            hopbridge_protocols::local(),
            &HopGroup::parse("ok:1|nonsense"),
            Tunnel::default(),
        );
        assert!(matches!(result, Err(ChainError::Format { .. })));
    }

    #[tokio::test]
    async fn test_bind_chain_must_listen() {
        let recorder = Recorder::new();
        let chain = ChainConfig {
            bind: vec![HopGroup::parse(":0"), HopGroup::parse("relay:1")],
            proxy: vec![HopGroup::parse("target:80")],
            idle_timeout: None,
        };
        let (_tx, rx) = watch::channel(false);
        let err = runner(&recorder).run(&chain, rx).await.unwrap_err();
        assert!(matches!(err, ChainError::ListenUnsupported), "{err}");
    }

    #[tokio::test]
    async fn test_pipe_cannot_serve_proxy() {
        let recorder = Recorder::new();
        let chain = ChainConfig {
            bind: Vec::new(),
            proxy: vec![HopGroup::parse("-")],
            idle_timeout: None,
        };
        let (_tx, rx) = watch::channel(false);
        let err = runner(&recorder).run(&chain, rx).await.unwrap_err();
        assert!(matches!(err, ChainError::Format { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_listening_chain_stops_on_shutdown() {
        let recorder = Recorder::new();
        let chain = ChainConfig {
            bind: vec![HopGroup::parse("127.0.0.1:0")],
            proxy: vec![HopGroup::parse("target:80")],
            idle_timeout: None,
        };
        let (tx, rx) = watch::channel(false);
        let runner = runner(&recorder);
        let task = tokio::spawn(async move { runner.run(&chain, rx).await });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
