//! Scheme name to bridger mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hopbridge_net::{resolve, BridgeError, Bridger, Hop};
use tracing::debug;

use crate::chain::redact_spec;
use crate::error::ChainError;

/// Bridgers keyed by scheme, plus an optional catch-all.
///
/// Built explicitly at start-up and shared by the chain builder; tests can
/// assemble as many independent registries as they need.
#[derive(Default)]
pub struct Registry {
    bridgers: HashMap<String, Arc<dyn Bridger>>,
    fallback: Option<Arc<dyn Bridger>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bridger` for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, bridger: Arc<dyn Bridger>) {
        self.bridgers.insert(scheme.into(), bridger);
    }

    /// Bridger used for schemes nothing else is registered for.
    pub fn register_default(&mut self, bridger: Arc<dyn Bridger>) {
        self.fallback = Some(bridger);
    }

    /// Find the bridger for `scheme`.
    pub fn lookup(&self, scheme: &str) -> Result<Arc<dyn Bridger>, ChainError> {
        self.bridgers
            .get(scheme)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ChainError::UnsupportedProtocol {
                scheme: scheme.to_string(),
            })
    }

    /// Resolve `spec` and find its bridger without building anything.
    pub fn check(&self, spec: &str) -> Result<Arc<dyn Bridger>, ChainError> {
        let endpoint = resolve(spec).ok_or_else(|| ChainError::Format {
            spec: redact_spec(spec),
        })?;
        self.lookup(&endpoint.transport)
    }

    /// Bridge a single hop specifier over `upstream`.
    pub async fn bridge(&self, upstream: Hop, spec: &str) -> Result<Hop, ChainError> {
        let bridger = self.check(spec)?;
        let redacted = redact_spec(spec);
        let hop = bridger
            .bridge(upstream, spec)
            .await
            .map_err(|source| ChainError::Bridge {
                source: match source {
                    // plugins echo the raw specifier, credentials included
                    BridgeError::InvalidAddress(_) => {
                        BridgeError::InvalidAddress(redacted.clone())
                    }
                    other => other,
                },
                spec: redacted.clone(),
            })?;
        debug!(hop = %redacted, "hop bridged");
        Ok(hop)
    }

    /// Registered scheme names, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<_> = self.bridgers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("schemes", &self.schemes())
            .field("default", &self.fallback.is_some())
            .finish()
    }
}

/// A registry holding every built-in plugin.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    for (scheme, bridger) in hopbridge_protocols::bridgers() {
        registry.register(scheme, bridger);
    }
    registry
}
