//! hopbridge core.
//!
//! Builds chains of proxy hops out of hop specifiers and runs them:
//! - `registry`: scheme to bridger lookup
//! - `chain`: right-to-left chain folding
//! - `lb`: multi-endpoint groups with penalty-based failover
//! - `tunnel`: pooled bidirectional copy with idle timeout
//! - `supervisor`: accept loops with listen backoff
//! - `demux`: SOCKS4/SOCKS5/HTTP sniffing for proxy-server mode
//! - `runner` and `reload`: running configured chains and applying reloads

pub mod chain;
pub mod config;
pub mod demux;
pub mod error;
pub mod idle;
pub mod lb;
pub mod pool;
pub mod registry;
pub mod reload;
pub mod runner;
pub mod shunt;
pub mod supervisor;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use chain::{describe_chain, redact_spec, ChainBuilder};
pub use config::{load_chains, ChainConfig, Config, HopGroup, PROXY_SENTINEL};
pub use demux::{plan_listeners, Demultiplexer, Protocol};
pub use error::{is_closed_error, AggregateDialError, ChainError, ConfigError};
pub use lb::{DialTimeoutPolicy, MultiEndpoint};
pub use pool::{BufferPool, PooledBuffer};
pub use registry::{default_registry, Registry};
pub use reload::{ChainSet, ReloadSummary};
pub use runner::{ChainRunner, StdioStream, TargetHandler};
pub use shunt::{HostMatcher, ShuntRules};
pub use supervisor::{BackoffPolicy, ConnectionHandler, ListenerSupervisor, SupervisorStats};
pub use tunnel::{Tunnel, TunnelStats};
