//! bridge
//!
//! Dials and listens through chains of proxy hops.
//!
//! ```text
//! bridge -b :8080 -p example.com:80 -p socks5://10.0.0.1:1080   # forward
//! bridge -b :1080 -p -                                          # proxy server
//! bridge -p example.com:22 -p http://gw:3128                    # stdio pipe
//! bridge -c chains.json                                         # config, SIGHUP reloads
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hopbridge::{
    default_registry, load_chains, ChainBuilder, ChainConfig, ChainRunner, ChainSet,
    DialTimeoutPolicy, ShuntRules,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Proxy chain runner.
#[derive(Debug, Parser)]
#[command(name = "bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address group, then the listen chain (repeatable).
    /// Without it stdin/stdout are tunneled.
    #[arg(short, long)]
    bind: Vec<String>,

    /// Dial target group (or `-` to serve as a proxy), then the dial chain
    /// (repeatable).
    #[arg(short, long)]
    proxy: Vec<String>,

    /// JSON chain config (repeatable). Reloaded on SIGHUP.
    #[arg(short, long, conflicts_with_all = ["bind", "proxy"])]
    config: Vec<PathBuf>,

    /// Close tunnels idle for this many seconds (command-line chains).
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Per-endpoint dial timeout in groups: `disabled`, `adaptive` or seconds.
    #[arg(long, default_value_t = DialTimeoutPolicy::Disabled)]
    dial_timeout: DialTimeoutPolicy,

    /// Seconds between health probes of groups that have one.
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries pipe-mode data, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let registry = Arc::new(default_registry());
    info!(schemes = ?registry.schemes(), "starting bridge");

    let shunt = ShuntRules::from_env();
    if !shunt.is_empty() {
        info!(?shunt, "target shunting enabled");
    }
    let builder = ChainBuilder::new(registry)
        .with_dial_timeout(cli.dial_timeout)
        .with_probe_interval(Duration::from_secs(cli.probe_interval.max(1)))
        .with_shunt(shunt);
    let runner = ChainRunner::new(builder);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => warn!(error = %e, "failed to listen for signals, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    if cli.config.is_empty() {
        if cli.proxy.is_empty() {
            bail!("nothing to do: pass -p or -c");
        }
        let mut chain =
            ChainConfig::from_args(&cli.bind, &cli.proxy).context("invalid command-line chain")?;
        chain.idle_timeout = cli.idle_timeout;
        runner
            .run(&chain, shutdown_rx)
            .await
            .context("chain failed")?;
    } else {
        let (reload_tx, reload_rx) = mpsc::channel(1);
        forward_hangups(reload_tx)?;
        let paths = cli.config;
        ChainSet::new(runner)
            .serve(move || load_chains(&paths), reload_rx, shutdown_rx)
            .await
            .context("failed to load config")?;
    }

    info!("bridge stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Turn every SIGHUP into a reload request.
#[cfg(unix)]
fn forward_hangups(reloads: mpsc::Sender<()>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("failed to watch SIGHUP")?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            info!("received SIGHUP");
            // a reload already queued covers this one
            let _ = reloads.try_send(());
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_hangups(_reloads: mpsc::Sender<()>) -> Result<()> {
    Ok(())
}
