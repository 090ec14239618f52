//! Listener supervision.
//!
//! Each listen address gets its own accept loop:
//!
//! ```text
//! RELISTEN --ok--> LISTENING --accept error--> FAILED --> BACKOFF --> RELISTEN
//!     \--error--> BACKOFF
//! ```
//!
//! An accept error that belongs to one connection (the peer aborted before
//! it was accepted) is logged and the listener keeps accepting. Any state
//! moves to CLOSED when the shutdown signal fires. Closing drops
//! the listener; connections already accepted keep running until their own
//! I/O ends.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hopbridge_net::{resolve, BoxedListener, BoxedStream, Endpoint, Hop};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use crate::chain::redact_spec;
use crate::error::{is_closed_error, ChainError};

/// Handles one accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, conn: BoxedStream, peer: &str) -> io::Result<()>;
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Ceiling; jitter never pushes a delay past it.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_secs_f64() * 2.0_f64.powi(attempt.min(62) as i32);
        let delay = delay.min(self.max.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter.min(1.0);
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay + jitter).clamp(0.0, self.max.as_secs_f64()))
    }
}

/// Consecutive-failure counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Counters shared by every accept loop of a supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose handler is still running.
    pub connections_active: AtomicU64,
    /// Failed listen attempts.
    pub listen_failures: AtomicU64,
    /// Accept errors that forced a relisten.
    pub accept_failures: AtomicU64,
    /// Accept errors of a single connection; the listener stayed open.
    pub connection_errors: AtomicU64,
}

/// Accept errors caused by one incoming connection rather than the listener.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Resolve once shutdown is requested or its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs accept loops for a set of listen addresses.
pub struct ListenerSupervisor {
    listen: Hop,
    endpoints: Vec<Endpoint>,
    handler: Arc<dyn ConnectionHandler>,
    backoff: BackoffPolicy,
    stats: Arc<SupervisorStats>,
}

impl ListenerSupervisor {
    /// Supervise `addresses` (hop specifiers such as `:8080` or
    /// `unix:/run/bridge.sock`) listened on through `listen`.
    pub fn new(
        listen: Hop,
        addresses: &[String],
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ChainError> {
        let endpoints = addresses
            .iter()
            .map(|spec| {
                resolve(spec).ok_or_else(|| ChainError::Format {
                    spec: redact_spec(spec),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            listen,
            endpoints,
            handler,
            backoff: BackoffPolicy::default(),
            stats: Arc::new(SupervisorStats::default()),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        self.stats.clone()
    }

    /// Run every accept loop until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();
        for endpoint in self.endpoints {
            let record = ListenerRecord {
                endpoint,
                listener: None,
                backoff: Backoff::new(self.backoff.clone()),
            };
            loops.spawn(record.run(
                self.listen.clone(),
                self.handler.clone(),
                self.stats.clone(),
                shutdown.clone(),
            ));
        }
        while loops.join_next().await.is_some() {}
    }
}

/// One listen address and its current socket.
struct ListenerRecord {
    endpoint: Endpoint,
    listener: Option<BoxedListener>,
    backoff: Backoff,
}

impl ListenerRecord {
    async fn run(
        mut self,
        listen: Hop,
        handler: Arc<dyn ConnectionHandler>,
        stats: Arc<SupervisorStats>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let network = self.endpoint.transport.clone();
        let address = self.endpoint.address.clone();
        loop {
            if self.listener.is_none() {
                let result = tokio::select! {
                    result = listen.listen(&network, &address) => result,
                    _ = cancelled(&mut shutdown) => break,
                };
                match result {
                    Ok(listener) => {
                        info!(listen = %listener.local_addr(), "listening");
                        self.backoff.reset();
                        self.listener = Some(listener);
                    }
                    Err(err) => {
                        stats.listen_failures.fetch_add(1, Ordering::Relaxed);
                        let delay = self.backoff.next_delay();
                        warn!(
                            listen = %address,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "listen failed"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancelled(&mut shutdown) => break,
                        }
                    }
                }
            }

            let Some(listener) = self.listener.as_ref() else {
                continue;
            };
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancelled(&mut shutdown) => break,
            };
            match accepted {
                Ok((conn, peer)) => {
                    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    stats.connections_active.fetch_add(1, Ordering::Relaxed);
                    let handler = handler.clone();
                    let stats = stats.clone();
                    let span = tracing::info_span!("connection", peer = %peer, listen = %address);
                    tokio::spawn(
                        async move {
                            match handler.handle(conn, &peer).await {
                                Ok(()) => debug!("connection closed"),
                                Err(err) if is_closed_error(&err) => {
                                    debug!(error = %err, "connection closed")
                                }
                                Err(err) => warn!(error = %err, "connection failed"),
                            }
                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        }
                        .instrument(span),
                    );
                }
                Err(err) if is_connection_error(&err) => {
                    stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(listen = %address, error = %err, "accept dropped a connection");
                }
                Err(err) => {
                    stats.accept_failures.fetch_add(1, Ordering::Relaxed);
                    self.listener = None;
                    let delay = self.backoff.next_delay();
                    if is_closed_error(&err) {
                        debug!(listen = %address, error = %err, "listener closed");
                    } else {
                        warn!(
                            listen = %address,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "accept failed"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut shutdown) => break,
                    }
                }
            }
        }
        if let Some(listener) = self.listener.take() {
            debug!(listen = %listener.local_addr(), "listener closed");
        }
    }
}
