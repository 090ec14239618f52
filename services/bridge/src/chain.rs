//! Chain construction.
//!
//! A chain `[A, B, C]` is folded right to left: `C` is bridged over the seed
//! hop, `B` over the result, `A` last, so `A` is the outermost layer and
//! every hop's own address is reached through everything after it.

use std::sync::Arc;
use std::time::Duration;

use hopbridge_net::{join_scheme_addr, resolve, Hop, HopUri};
use hopbridge_protocols::local;
use tracing::debug;

use crate::config::{ChainConfig, HopGroup};
use crate::error::ChainError;
use crate::lb::{DialTimeoutPolicy, MultiEndpoint, DEFAULT_PROBE_INTERVAL};
use crate::registry::Registry;
use crate::shunt::ShuntRules;

/// Strip credentials and query options from a hop specifier for display.
pub fn redact_spec(spec: &str) -> String {
    if let Some(uri) = HopUri::parse(spec) {
        if uri.opaque.is_empty() && (uri.username.is_some() || !uri.query.is_empty()) {
            return format!("{}://{}{}", uri.scheme, uri.host, uri.path);
        }
    }
    resolve(spec)
        .and_then(|endpoint| join_scheme_addr(&endpoint.transport, &endpoint.address))
        .unwrap_or_else(|| spec.to_string())
}

fn describe_group(group: &HopGroup) -> String {
    let joined = group
        .lb
        .iter()
        .map(|spec| redact_spec(spec))
        .collect::<Vec<_>>()
        .join("|");
    format!("{joined:?}")
}

/// One-line picture of a chain, e.g.
/// `DIAL "tcp://a:80" <- "socks5://b:1080" <- LOCAL <- "tcp://:8080" LISTEN`.
pub fn describe_chain(chain: &ChainConfig) -> String {
    let dials: Vec<_> = chain.proxy.iter().map(describe_group).collect();
    let listens: Vec<_> = chain.bind.iter().rev().map(describe_group).collect();
    if listens.is_empty() {
        format!("DIAL {} <- LOCAL <- STDIO", dials.join(" <- "))
    } else {
        format!(
            "DIAL {} <- LOCAL <- {} LISTEN",
            dials.join(" <- "),
            listens.join(" <- ")
        )
    }
}

/// Folds hop groups into hops through a [`Registry`].
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    registry: Arc<Registry>,
    dial_timeout: DialTimeoutPolicy,
    probe_interval: Duration,
    shunt: ShuntRules,
}

impl ChainBuilder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            dial_timeout: DialTimeoutPolicy::default(),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            shunt: ShuntRules::default(),
        }
    }

    /// Per-endpoint dial timeout for multi-address groups.
    pub fn with_dial_timeout(mut self, policy: DialTimeoutPolicy) -> Self {
        self.dial_timeout = policy;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Targets that bypass (or exclusively use) dial chains.
    pub fn with_shunt(mut self, shunt: ShuntRules) -> Self {
        self.shunt = shunt;
        self
    }

    /// Fold `groups` over `seed`, last group first.
    pub async fn build(&self, seed: Hop, groups: &[HopGroup]) -> Result<Hop, ChainError> {
        let mut hop = seed;
        for group in groups.iter().rev() {
            hop = self.build_group(hop, group).await?;
        }
        Ok(hop)
    }

    async fn build_group(&self, upstream: Hop, group: &HopGroup) -> Result<Hop, ChainError> {
        match group.lb.as_slice() {
            [] => Err(ChainError::EmptyGroup),
            [spec] if group.probe.is_none() => self.registry.bridge(upstream, spec).await,
            specs => {
                // catch format and scheme errors at build time; hops are
                // bridged on first use
                for spec in specs {
                    self.registry.check(spec)?;
                }
                let endpoints = Arc::new(MultiEndpoint::new(
                    specs.to_vec(),
                    upstream,
                    self.registry.clone(),
                    self.dial_timeout,
                ));
                if let Some(probe) = &group.probe {
                    endpoints.spawn_probe(probe.clone(), self.probe_interval);
                }
                debug!(hops = specs.len(), "multi-endpoint group built");
                Ok(endpoints.into_hop())
            }
        }
    }

    /// The dial side of a chain: `proxy[1..]` over the local hop, with
    /// shunting applied.
    pub async fn dial_chain(&self, groups: &[HopGroup]) -> Result<Hop, ChainError> {
        if groups.is_empty() {
            return Ok(local());
        }
        let hop = self.build(local(), groups).await?;
        if self.shunt.is_empty() {
            return Ok(hop);
        }
        Ok(self.shunt.apply(hop, local()))
    }

    /// The listen side of a chain: `bind[1..]` over the local hop. The last
    /// hop must be able to listen.
    pub async fn listen_chain(&self, groups: &[HopGroup]) -> Result<Hop, ChainError> {
        if groups.is_empty() {
            return Ok(local());
        }
        let hop = self.build(local(), groups).await?;
        if hop.listen.is_none() {
            return Err(ChainError::ListenUnsupported);
        }
        Ok(hop)
    }
}
