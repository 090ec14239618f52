//! Multi-endpoint dialer.
//!
//! A hop group with several interchangeable addresses is served by one
//! [`MultiEndpoint`]. Every dial picks the least penalized address, builds
//! its hop on first use, and moves on to the next candidate when the build
//! or the dial fails. Penalties only grow: a pick costs 1, a failed dial 8
//! and a failed build 16.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hopbridge_net::{
    resolve, BoxedListener, BoxedStream, CommandDialer, Dialer, Hop, ListenConfig,
};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::chain::redact_spec;
use crate::error::{AggregateDialError, ChainError};
use crate::registry::Registry;

/// Added to an address every time it is picked.
pub const PICK_PENALTY: u32 = 1;
/// Added when a built hop fails to dial.
pub const DIAL_FAILURE_PENALTY: u32 = 8;
/// Added when the hop for an address cannot be built.
pub const BUILD_FAILURE_PENALTY: u32 = 16;

/// Once the smallest counter passes this, every counter is rebased.
const PENALTY_CEILING: u32 = 1 << 24;

/// Default interval between health probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

const ADAPTIVE_INITIAL: Duration = Duration::from_secs(30);
const ADAPTIVE_FLOOR: Duration = Duration::from_millis(500);

/// Per-address penalty counters, indexed like the address list.
#[derive(Debug, Clone)]
pub(crate) struct Penalties {
    counts: Vec<u32>,
}

impl Penalties {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            counts: vec![0; len],
        }
    }

    /// Pick the least penalized index not yet tried and charge it a pick.
    /// Ties go to the lowest index.
    pub(crate) fn select(&mut self, tried: &[bool]) -> Option<usize> {
        let index = self
            .counts
            .iter()
            .enumerate()
            .filter(|(i, _)| !tried.get(*i).copied().unwrap_or(false))
            .min_by_key(|(_, count)| **count)
            .map(|(i, _)| i)?;
        self.add(index, PICK_PENALTY);
        Some(index)
    }

    pub(crate) fn add(&mut self, index: usize, amount: u32) {
        if let Some(count) = self.counts.get_mut(index) {
            *count = count.saturating_add(amount);
        }
        self.rebase();
    }

    fn rebase(&mut self) {
        let Some(&min) = self.counts.iter().min() else {
            return;
        };
        if min > PENALTY_CEILING {
            for count in &mut self.counts {
                *count -= min;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u32> {
        self.counts.clone()
    }
}

/// How long a single endpoint may take to dial before the next candidate is
/// tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialTimeoutPolicy {
    /// Wait as long as the endpoint takes.
    #[default]
    Disabled,
    /// Fixed limit per attempt.
    Fixed(Duration),
    /// Twice the rolling latency of successful dials, 30 s until the first
    /// success, never below 500 ms.
    Adaptive,
}

impl FromStr for DialTimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" | "none" | "0" => Ok(Self::Disabled),
            "adaptive" => Ok(Self::Adaptive),
            secs => secs
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(|secs| Self::Fixed(Duration::from_secs_f64(secs)))
                .ok_or_else(|| {
                    format!("expected disabled, adaptive or seconds, got {s:?}")
                }),
        }
    }
}

impl fmt::Display for DialTimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Adaptive => f.write_str("adaptive"),
            Self::Fixed(limit) => write!(f, "{}", limit.as_secs_f64()),
        }
    }
}

/// Applies a [`DialTimeoutPolicy`] and tracks observed latency.
#[derive(Debug)]
pub(crate) struct DialTimer {
    policy: DialTimeoutPolicy,
    latency_ms: AtomicU64,
}

impl DialTimer {
    pub(crate) fn new(policy: DialTimeoutPolicy) -> Self {
        Self {
            policy,
            latency_ms: AtomicU64::new(ADAPTIVE_INITIAL.as_millis() as u64),
        }
    }

    pub(crate) fn limit(&self) -> Option<Duration> {
        match self.policy {
            DialTimeoutPolicy::Disabled => None,
            DialTimeoutPolicy::Fixed(limit) => Some(limit),
            DialTimeoutPolicy::Adaptive => {
                Some(Duration::from_millis(self.latency_ms.load(Ordering::Relaxed)) * 2)
            }
        }
    }

    /// Fold a successful dial's latency into the rolling estimate.
    pub(crate) fn observe(&self, elapsed: Duration) {
        if self.policy != DialTimeoutPolicy::Adaptive {
            return;
        }
        let sample = elapsed.as_millis().min(u128::from(u32::MAX)) as u64;
        let _ = self
            .latency_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = (current * 7 + sample) / 8;
                Some(next.max(ADAPTIVE_FLOOR.as_millis() as u64))
            });
    }

    pub(crate) async fn dial(
        &self,
        hop: &Hop,
        network: &str,
        address: &str,
    ) -> io::Result<BoxedStream> {
        let started = Instant::now();
        let result = match self.limit() {
            None => hop.dial(network, address).await,
            Some(limit) => tokio::time::timeout(limit, hop.dial(network, address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial {address} timed out after {limit:?}"),
                    )
                })?,
        };
        if result.is_ok() {
            self.observe(started.elapsed());
        }
        result
    }
}

/// Load-balancing dialer over the alternative addresses of one hop group.
pub struct MultiEndpoint {
    specs: Vec<String>,
    upstream: Hop,
    registry: Arc<Registry>,
    slots: Vec<OnceCell<Hop>>,
    penalties: Mutex<Penalties>,
    timer: DialTimer,
}

impl MultiEndpoint {
    pub fn new(
        specs: Vec<String>,
        upstream: Hop,
        registry: Arc<Registry>,
        timeout: DialTimeoutPolicy,
    ) -> Self {
        Self {
            slots: specs.iter().map(|_| OnceCell::new()).collect(),
            penalties: Mutex::new(Penalties::new(specs.len())),
            timer: DialTimer::new(timeout),
            specs,
            upstream,
            registry,
        }
    }

    /// Expose dial, listen and command capabilities.
    ///
    /// Listen and command requests go to the least penalized address and fail
    /// at call time if its hop lacks the capability.
    pub fn into_hop(self: Arc<Self>) -> Hop {
        Hop {
            dialer: self.clone(),
            listen: Some(self.clone()),
            command: Some(self),
        }
    }

    /// Current penalty counters, indexed like the addresses.
    pub fn penalties(&self) -> Vec<u32> {
        self.lock().snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, Penalties> {
        // counters stay consistent even if a holder panicked
        self.penalties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn penalize(&self, index: usize, amount: u32) {
        self.lock().add(index, amount);
    }

    async fn endpoint(&self, index: usize) -> Result<&Hop, ChainError> {
        self.slots[index]
            .get_or_try_init(|| self.registry.bridge(self.upstream.clone(), &self.specs[index]))
            .await
    }

    /// Pick an address and build its hop, penalizing build failures.
    async fn pick(&self, tried: &mut [bool]) -> Option<Result<(usize, &Hop), io::Error>> {
        let index = self.lock().select(tried)?;
        tried[index] = true;
        Some(match self.endpoint(index).await {
            Ok(hop) => Ok((index, hop)),
            Err(err) => {
                warn!(hop = %redact_spec(&self.specs[index]), error = %err, "failed to build hop");
                self.penalize(index, BUILD_FAILURE_PENALTY);
                Err(io::Error::other(err))
            }
        })
    }

    /// Route a listen or command request to the best buildable address.
    async fn best(&self) -> io::Result<&Hop> {
        let mut tried = vec![false; self.specs.len()];
        let mut errors = Vec::new();
        while let Some(picked) = self.pick(&mut tried).await {
            match picked {
                Ok((_, hop)) => return Ok(hop),
                Err(err) => errors.push(err),
            }
        }
        Err(AggregateDialError { errors }.into())
    }

    /// Start dialing `probe` through every address every `interval`.
    ///
    /// The task only holds a weak reference and stops once the dialer is
    /// dropped.
    pub fn spawn_probe(self: &Arc<Self>, probe: String, interval: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(target) = resolve(&probe) else {
                warn!(probe = %redact_spec(&probe), "unsupported probe address");
                return;
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = Weak::upgrade(&weak) else {
                    break;
                };
                this.probe_once(&target.transport, &target.address).await;
            }
        });
    }

    async fn probe_once(&self, network: &str, address: &str) {
        for (index, spec) in self.specs.iter().enumerate() {
            let hop = match self.endpoint(index).await {
                Ok(hop) => hop,
                Err(err) => {
                    debug!(hop = %redact_spec(spec), error = %err, "probe build failed");
                    self.penalize(index, BUILD_FAILURE_PENALTY);
                    continue;
                }
            };
            if let Err(err) = self.timer.dial(hop, network, address).await {
                debug!(hop = %redact_spec(spec), target = address, error = %err, "probe failed");
                self.penalize(index, DIAL_FAILURE_PENALTY);
            }
        }
    }
}

impl fmt::Debug for MultiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiEndpoint")
            .field("specs", &self.specs.iter().map(|s| redact_spec(s)).collect::<Vec<_>>())
            .field("penalties", &self.penalties())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for MultiEndpoint {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        let attempts = self.specs.len() / 2 + 1;
        let mut tried = vec![false; self.specs.len()];
        let mut errors = Vec::with_capacity(attempts);

        for _ in 0..attempts {
            let Some(picked) = self.pick(&mut tried).await else {
                break;
            };
            let (index, hop) = match picked {
                Ok(picked) => picked,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            match self.timer.dial(hop, network, address).await {
                Ok(conn) => {
                    debug!(hop = %redact_spec(&self.specs[index]), target = address, "dialed");
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(
                        hop = %redact_spec(&self.specs[index]),
                        target = address,
                        error = %err,
                        "failed dial"
                    );
                    self.penalize(index, DIAL_FAILURE_PENALTY);
                    errors.push(err);
                }
            }
        }
        Err(AggregateDialError { errors }.into())
    }
}

#[async_trait]
impl ListenConfig for MultiEndpoint {
    async fn listen(&self, network: &str, address: &str) -> io::Result<BoxedListener> {
        self.best().await?.listen(network, address).await
    }
}

#[async_trait]
impl CommandDialer for MultiEndpoint {
    async fn command_dial(&self, name: &str, args: &[String]) -> io::Result<BoxedStream> {
        let hop = self.best().await?;
        let command = hop.command.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "hop cannot run commands")
        })?;
        command.command_dial(name, args).await
    }
}
