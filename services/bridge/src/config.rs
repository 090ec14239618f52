//! Chain configuration.
//!
//! Chains come from JSON files or from `-b`/`-p` command-line lists:
//!
//! ```json
//! {"chains": [{"bind": [":8080"], "proxy": ["-", "socks5://10.0.0.1:1080|socks5://10.0.0.2:1080"], "idle_timeout": 300}]}
//! ```
//!
//! A hop group is written as `"a|b"`, `["a", "b"]`, or
//! `{"lb": ["a", "b"], "probe": "tcp://health:80"}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hopbridge_net::resolve;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::ConfigError;

/// Dial target meaning "serve as a proxy".
pub const PROXY_SENTINEL: &str = "-";

/// Interchangeable addresses for one hop, plus an optional health probe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "GroupRepr")]
pub struct HopGroup {
    pub lb: Vec<String>,
    pub probe: Option<String>,
}

impl HopGroup {
    /// Parse the `a|b|c` form.
    pub fn parse(group: &str) -> Self {
        Self {
            lb: group.split('|').map(str::to_string).collect(),
            probe: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.lb.first().is_some_and(|first| first == PROXY_SENTINEL)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupRepr {
    Joined(String),
    List(Vec<String>),
    Full {
        lb: Vec<String>,
        #[serde(default)]
        probe: Option<String>,
    },
}

impl From<GroupRepr> for HopGroup {
    fn from(repr: GroupRepr) -> Self {
        match repr {
            GroupRepr::Joined(group) => Self::parse(&group),
            GroupRepr::List(lb) => Self { lb, probe: None },
            GroupRepr::Full { lb, probe } => Self { lb, probe },
        }
    }
}

impl Serialize for HopGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Full<'a> {
            lb: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            probe: Option<&'a str>,
        }

        match (self.lb.as_slice(), self.probe.as_deref()) {
            ([single], None) => serializer.serialize_str(single),
            (lb, probe) => Full { lb, probe }.serialize(serializer),
        }
    }
}

/// One chain: where to listen and what to dial.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    /// `bind[0]` lists the listen addresses, `bind[1..]` the listen chain.
    /// Empty means stdin/stdout.
    #[serde(default)]
    pub bind: Vec<HopGroup>,
    /// `proxy[0]` lists the dial targets (or `-`), `proxy[1..]` the dial chain.
    #[serde(default)]
    pub proxy: Vec<HopGroup>,
    /// Seconds a tunnel may stay silent before it is closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u64>,
}

impl ChainConfig {
    /// Build a chain from `-b` and `-p` values.
    ///
    /// With `-p -` and a single plain TCP bind address, the address answers
    /// HTTP, SOCKS5 and SOCKS4 alike.
    pub fn from_args(bind: &[String], proxy: &[String]) -> Result<Self, ConfigError> {
        let mut bind: Vec<HopGroup> = bind.iter().map(|group| HopGroup::parse(group)).collect();
        let proxy: Vec<HopGroup> = proxy.iter().map(|group| HopGroup::parse(group)).collect();

        let serve_proxy = proxy.first().is_some_and(HopGroup::is_sentinel);
        if let (true, Some(listen)) = (serve_proxy, bind.first_mut()) {
            if let [single] = listen.lb.as_slice() {
                if let Some(endpoint) = resolve(single).filter(|e| e.transport == "tcp") {
                    listen.lb = ["http", "socks5", "socks4"]
                        .iter()
                        .map(|scheme| format!("{scheme}://{}", endpoint.address))
                        .collect();
                }
            }
        }

        let chain = Self {
            bind,
            proxy,
            idle_timeout: None,
        };
        chain.verify("command line", 0)?;
        Ok(chain)
    }

    pub fn verify(&self, origin: &str, index: usize) -> Result<(), ConfigError> {
        if self.proxy.is_empty() {
            return Err(ConfigError::EmptyProxy {
                origin: origin.to_string(),
                index,
            });
        }
        let empty = |group: &HopGroup| group.lb.is_empty() || group.lb.iter().any(String::is_empty);
        if self.bind.iter().chain(&self.proxy).any(empty) {
            return Err(ConfigError::EmptyGroup {
                origin: origin.to_string(),
                index,
            });
        }
        Ok(())
    }

    /// Stable key telling whether two chains are the same for reloads.
    pub fn identity(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Stdin/stdout mode.
    pub fn is_pipe(&self) -> bool {
        self.bind.is_empty()
    }
}

/// A config file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl Config {
    /// Read and verify one file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let origin = path.display().to_string();
        for (index, chain) in config.chains.iter().enumerate() {
            chain.verify(&origin, index)?;
        }
        Ok(config)
    }
}

/// Every chain of every file, in file order.
pub fn load_chains(paths: &[PathBuf]) -> Result<Vec<ChainConfig>, ConfigError> {
    let mut chains = Vec::new();
    for path in paths {
        chains.extend(Config::load(path)?.chains);
    }
    Ok(chains)
}
