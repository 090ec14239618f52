//! Running a set of chains and applying config reloads.
//!
//! Chains are keyed by [`ChainConfig::identity`]. A reload stops chains that
//! disappeared, starts new ones and leaves unchanged ones (and their open
//! tunnels) alone.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::chain::describe_chain;
use crate::config::ChainConfig;
use crate::error::ConfigError;
use crate::runner::ChainRunner;
use crate::supervisor::cancelled;

/// Delay before a chain that failed to build is tried again, and between
/// attempts to reload an unreadable config.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What one [`ChainSet::apply`] changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: usize,
    pub stopped: usize,
    pub kept: usize,
}

struct RunningChain {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The chains currently running, each under its own stop signal.
pub struct ChainSet {
    runner: ChainRunner,
    running: HashMap<String, RunningChain>,
}

impl ChainSet {
    pub fn new(runner: ChainRunner) -> Self {
        Self {
            runner,
            running: HashMap::new(),
        }
    }

    /// Identities of the running chains, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<_> = self.running.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Make `chains` the running set.
    pub fn apply(&mut self, chains: Vec<ChainConfig>) -> ReloadSummary {
        let mut wanted: HashMap<String, ChainConfig> = chains
            .into_iter()
            .map(|chain| (chain.identity(), chain))
            .collect();
        let mut summary = ReloadSummary::default();

        self.running.retain(|identity, running| {
            if wanted.remove(identity).is_some() {
                summary.kept += 1;
                return true;
            }
            // listeners close; established tunnels drain on their own
            let _ = running.stop.send(true);
            summary.stopped += 1;
            false
        });
        for (identity, chain) in wanted {
            let running = self.start(chain);
            self.running.insert(identity, running);
            summary.started += 1;
        }

        info!(
            started = summary.started,
            stopped = summary.stopped,
            kept = summary.kept,
            "chains applied"
        );
        summary
    }

    fn start(&self, chain: ChainConfig) -> RunningChain {
        let (stop, mut stopped) = watch::channel(false);
        let runner = self.runner.clone();
        let span = tracing::info_span!("chain", chain = %describe_chain(&chain));
        let task = tokio::spawn(
            async move {
                loop {
                    match runner.run(&chain, stopped.clone()).await {
                        Ok(()) => break,
                        Err(err) => {
                            error!(
                                error = %err,
                                retry_in_ms = RETRY_DELAY.as_millis() as u64,
                                "chain failed"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                                _ = cancelled(&mut stopped) => break,
                            }
                        }
                    }
                }
                info!("chain stopped");
            }
            .instrument(span),
        );
        RunningChain { stop, task }
    }

    /// Stop every chain and wait for their listeners to close.
    pub async fn shutdown(&mut self) {
        let running: Vec<_> = self.running.drain().map(|(_, running)| running).collect();
        for chain in &running {
            let _ = chain.stop.send(true);
        }
        join_all(running.into_iter().map(|chain| chain.task)).await;
    }

    /// Run the chains `load` returns, reloading on every message from
    /// `reloads`, until `shutdown` fires.
    ///
    /// The first load must succeed. A failed reload keeps the current chains
    /// and is retried every [`RETRY_DELAY`] until it succeeds.
    pub async fn serve<F>(
        mut self,
        load: F,
        mut reloads: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConfigError>
    where
        F: Fn() -> Result<Vec<ChainConfig>, ConfigError>,
    {
        self.apply(load()?);
        'serve: loop {
            tokio::select! {
                reload = reloads.recv() => {
                    if reload.is_none() {
                        cancelled(&mut shutdown).await;
                        break;
                    }
                }
                _ = cancelled(&mut shutdown) => break,
            }

            info!("reloading");
            loop {
                match load() {
                    Ok(chains) => {
                        self.apply(chains);
                        break;
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            retry_in_ms = RETRY_DELAY.as_millis() as u64,
                            "reload failed"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                            _ = cancelled(&mut shutdown) => break 'serve,
                        }
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::chain::ChainBuilder;
    use crate::config::HopGroup;
    use crate::registry::Registry;
    use crate::testing::Recorder;

    fn chain(bind: &[&str], target: &str) -> ChainConfig {
        ChainConfig {
            bind: bind.iter().map(|group| HopGroup::parse(group)).collect(),
            proxy: vec![HopGroup::parse(target)],
            idle_timeout: None,
        }
    }

    fn chain_set(recorder: &Recorder) -> ChainSet {
        let mut registry = Registry::new();
        registry.register_default(recorder.bridger("rec"));
        ChainSet::new(ChainRunner::new(ChainBuilder::new(Arc::new(registry))))
    }

    #[tokio::test]
    async fn test_apply_diffs_by_identity() {
        let recorder = Recorder::new();
        let mut set = chain_set(&recorder);
        let a = chain(&["127.0.0.1:0"], "a:1");
        let b = chain(&["127.0.0.1:0"], "b:1");
        let c = chain(&["127.0.0.1:0"], "c:1");

        let summary = set.apply(vec![a.clone(), b.clone()]);
        assert_eq!(
            summary,
            ReloadSummary {
                started: 2,
                stopped: 0,
                kept: 0
            }
        );

        let summary = set.apply(vec![b.clone(), c.clone(), c.clone()]);
        assert_eq!(
            summary,
            ReloadSummary {
                started: 1,
                stopped: 1,
                kept: 1
            }
        );
        let mut expected = vec![b.identity(), c.identity()];
        expected.sort();
        assert_eq!(set.identities(), expected);

        set.shutdown().await;
        assert!(set.identities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chain_is_retried() {
        let recorder = Recorder::new();
        let mut set = chain_set(&recorder);
        // the relay hop cannot listen, so every build fails
        set.apply(vec![chain(&["127.0.0.1:0", "relay:1"], "t:1")]);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let builds = recorder
            .calls()
            .iter()
            .filter(|call| call.starts_with("rec relay:1"))
            .count();
        assert!(builds >= 3, "{builds} builds");

        set.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_reloads_and_retries_bad_loads() {
        let recorder = Recorder::new();
        let set = chain_set(&recorder);
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let load = move || {
            // the first load and the third reload attempt succeed
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 3 => Ok(vec![chain(&["127.0.0.1:0"], "a:1")]),
                _ => Err(ConfigError::EmptyProxy {
                    origin: "test".into(),
                    index: 0,
                }),
            }
        };
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let served = tokio::spawn(set.serve(load, reload_rx, stop_rx));

        reload_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(loads.load(Ordering::SeqCst), 4);

        stop_tx.send(true).unwrap();
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_fails_on_first_load() {
        let recorder = Recorder::new();
        let set = chain_set(&recorder);
        let (_reload_tx, reload_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = set
            .serve(
                || {
                    Err(ConfigError::EmptyProxy {
                        origin: "test".into(),
                        index: 0,
                    })
                },
                reload_rx,
                stop_rx,
            )
            .await;
        assert!(matches!(result, Err(ConfigError::EmptyProxy { .. })));
    }
}
