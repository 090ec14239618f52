//! `NO_PROXY` / `ONLY_PROXY` target shunting.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use hopbridge_net::{split_host_port, BoxedStream, Dialer, Hop};
use tracing::debug;

/// Host patterns from a comma-separated list: `*`, `example.com`,
/// `.example.com` or `*.example.com` (the domain and its subdomains), or a
/// literal IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatcher {
    any: bool,
    exact: Vec<String>,
    suffixes: Vec<String>,
}

impl HostMatcher {
    /// Parse a list. Returns `None` when it holds no patterns.
    pub fn parse(list: &str) -> Option<Self> {
        let mut matcher = Self {
            any: false,
            exact: Vec::new(),
            suffixes: Vec::new(),
        };
        for pattern in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let pattern = pattern.to_ascii_lowercase();
            if pattern == "*" {
                matcher.any = true;
            } else if let Some(domain) = pattern
                .strip_prefix("*.")
                .or_else(|| pattern.strip_prefix('.'))
            {
                matcher.suffixes.push(domain.to_string());
            } else {
                let host = pattern
                    .strip_prefix('[')
                    .and_then(|p| p.strip_suffix(']'))
                    .unwrap_or(&pattern);
                matcher.exact.push(host.to_string());
            }
        }
        (matcher.any || !matcher.exact.is_empty() || !matcher.suffixes.is_empty())
            .then_some(matcher)
    }

    /// Whether the host of `address` (`host:port` or a bare host) matches.
    pub fn matches(&self, address: &str) -> bool {
        if self.any {
            return true;
        }
        let host = split_host_port(address)
            .map_or(address, |(host, _)| host)
            .trim_end_matches('.')
            .to_ascii_lowercase();
        self.exact.iter().any(|exact| *exact == host)
            || self.suffixes.iter().any(|suffix| {
                host == *suffix
                    || host
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            })
    }
}

/// Which targets skip the proxy chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShuntRules {
    /// Matching targets are dialed directly.
    pub no_proxy: Option<HostMatcher>,
    /// When set, only matching targets use the chain.
    pub only_proxy: Option<HostMatcher>,
}

impl ShuntRules {
    /// Rules from `no_proxy`/`NO_PROXY` and `only_proxy`/`ONLY_PROXY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Rules from any variable source; lowercase names win.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |lower: &str, upper: &str| {
            lookup(lower)
                .or_else(|| lookup(upper))
                .and_then(|list| HostMatcher::parse(&list))
        };
        Self {
            no_proxy: read("no_proxy", "NO_PROXY"),
            only_proxy: read("only_proxy", "ONLY_PROXY"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.no_proxy.is_none() && self.only_proxy.is_none()
    }

    /// Wrap a built dial chain so shunted targets go through `direct`.
    /// Listen and command capabilities of the chain are kept.
    pub fn apply(&self, chain: Hop, direct: Hop) -> Hop {
        let mut dialer = chain.clone();
        if let Some(only) = &self.only_proxy {
            dialer = Hop::dial_only(Arc::new(ShuntDialer {
                fallback: direct.clone(),
                matched: dialer,
                matcher: only.clone(),
            }));
        }
        if let Some(no) = &self.no_proxy {
            dialer = Hop::dial_only(Arc::new(ShuntDialer {
                fallback: dialer,
                matched: direct,
                matcher: no.clone(),
            }));
        }
        Hop {
            dialer: dialer.dialer,
            listen: chain.listen,
            command: chain.command,
        }
    }
}

/// Sends matching targets to one hop and everything else to another.
struct ShuntDialer {
    fallback: Hop,
    matched: Hop,
    matcher: HostMatcher,
}

#[async_trait]
impl Dialer for ShuntDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        if self.matcher.matches(address) {
            debug!(target = address, "shunted");
            return self.matched.dial(network, address).await;
        }
        self.fallback.dial(network, address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;
    use rstest::rstest;
    use std::collections::HashMap;

    #[rstest]
    #[case("*", "anything:80", true)]
    #[case("example.com", "example.com:443", true)]
    #[case("example.com", "www.example.com:443", false)]
    #[case(".example.com", "www.example.com:443", true)]
    #[case(".example.com", "example.com:443", true)]
    #[case("*.example.com", "a.b.example.com:80", true)]
    #[case("*.example.com", "badexample.com:80", false)]
    #[case("10.0.0.1", "10.0.0.1:22", true)]
    #[case("[::1]", "[::1]:22", true)]
    #[case("Internal.Corp", "internal.corp", true)]
    #[case("a.com, b.com", "b.com:1", true)]
    fn test_host_patterns(#[case] list: &str, #[case] address: &str, #[case] expected: bool) {
        let matcher = HostMatcher::parse(list).unwrap();
        assert_eq!(matcher.matches(address), expected, "{list} vs {address}");
    }

    #[test]
    fn test_blank_lists_are_ignored() {
        assert!(HostMatcher::parse("").is_none());
        assert!(HostMatcher::parse(" , ").is_none());

        let env = HashMap::from([("NO_PROXY", "localhost"), ("no_proxy", "")]);
        let rules = ShuntRules::from_lookup(|name| env.get(name).map(|v| v.to_string()));
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn test_no_proxy_and_only_proxy_routing() {
        let recorder = Recorder::new();
        let bridger = recorder.bridger("rec");
        let chain = bridger.bridge(recorder.seed(), "proxy:1").await.unwrap();
        let direct = bridger.bridge(recorder.seed(), "direct:1").await.unwrap();

        let env = HashMap::from([("NO_PROXY", ".lan"), ("ONLY_PROXY", "*.corp,.lan")]);
        let rules = ShuntRules::from_lookup(|name| env.get(name).map(|v| v.to_string()));
        let hop = rules.apply(chain, direct);

        for target in ["printer.lan:631", "git.corp:22", "example.com:80"] {
            hop.dial("tcp", target).await.unwrap();
        }
        assert_eq!(
            recorder.dials(),
            vec![
                "dial printer.lan:631 via direct:1",
                "dial git.corp:22 via proxy:1",
                "dial example.com:80 via direct:1",
            ]
        );
    }
}
