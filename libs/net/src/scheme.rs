//! Hop specifier grammar.
//!
//! A hop specifier is a loosely URI-shaped string: `socks5://user@host:1080`,
//! `cmd: nc %h %p`, `:8080`, `./proxy.sock`. [`resolve`] turns it into a
//! transport and an address. Rules, first match wins:
//!
//! 1. `scheme:` with nothing after the colon
//! 2. `:port`
//! 3. `./path` or `/path` (unix socket)
//! 4. URI with a scheme: host, else path, else query for the hierarchical form;
//!    trimmed opaque text when it contains a space, `.` or `/`; `tcp` when the
//!    scheme itself contains a `.` (`domain.local:1111`)
//! 5. anything containing `:` is a bare `host:port`

/// A resolved `(transport, address)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Transport or scheme name, never empty.
    pub transport: String,
    /// Address payload, may be empty for bare `scheme:` specifiers.
    pub address: String,
}

impl Endpoint {
    fn new(transport: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            address: address.into(),
        }
    }
}

/// Resolve a hop specifier. Returns `None` when no rule matches.
pub fn resolve(spec: &str) -> Option<Endpoint> {
    if let Some(transport) = spec.strip_suffix(':') {
        if transport.is_empty() {
            return None;
        }
        return Some(Endpoint::new(transport, ""));
    }
    if spec.starts_with(':') {
        return Some(Endpoint::new("tcp", spec));
    }
    if spec.starts_with("./") || spec.starts_with('/') {
        return Some(Endpoint::new("unix", spec));
    }

    if let Some(uri) = HopUri::parse(spec) {
        if uri.opaque.is_empty() {
            if !uri.host.is_empty() {
                return Some(Endpoint::new(uri.scheme, uri.host));
            }
            if !uri.path.is_empty() {
                return Some(Endpoint::new(uri.scheme, uri.path));
            }
            if uri.force_query || !uri.query.is_empty() {
                return Some(Endpoint::new(uri.scheme, uri.query));
            }
        }

        if uri.opaque.contains([' ', '.', '/']) {
            let address = uri.opaque.trim().to_string();
            return Some(Endpoint::new(uri.scheme, address));
        }

        if uri.scheme.contains('.') {
            return Some(Endpoint::new(
                "tcp",
                join_host_port(&uri.scheme, uri.opaque.trim()),
            ));
        }
    }

    if spec.contains(':') {
        return Some(Endpoint::new("tcp", spec));
    }

    None
}

/// Rebuild a specifier from a transport and address, dropping everything else
/// (credentials, query). Used to print chains without secrets.
pub fn join_scheme_addr(scheme: &str, address: &str) -> Option<String> {
    match (scheme.is_empty(), address.is_empty()) {
        (true, true) => None,
        (false, true) => Some(format!("{scheme}:")),
        (true, false) => Some(format!("tcp://{address}")),
        (false, false) => Some(format!("{scheme}://{address}")),
    }
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split `host:port` (or `[v6]:port`). The host may be empty (`:8080`).
pub fn split_host_port(address: &str) -> Option<(&str, &str)> {
    let (host, port) = address.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}

/// The pieces of a URI-shaped hop specifier.
///
/// Parsing follows the lenient split most URL libraries do for
/// `scheme:opaque` vs `scheme://userinfo@host/path?query`, without
/// percent-decoding or host validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HopUri {
    pub scheme: String,
    pub opaque: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub path: String,
    pub query: String,
    pub force_query: bool,
}

impl HopUri {
    /// Parse a specifier that carries a scheme. Returns `None` without one.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.split_once('#').map_or(spec, |(s, _)| s);
        let (scheme, rest) = split_scheme(spec)?;

        let mut uri = HopUri {
            scheme: scheme.to_string(),
            ..Default::default()
        };

        let rest = if let Some(stripped) = rest.strip_suffix('?').filter(|r| !r.contains('?')) {
            uri.force_query = true;
            stripped
        } else if let Some((before, query)) = rest.split_once('?') {
            uri.query = query.to_string();
            before
        } else {
            rest
        };

        if !rest.starts_with('/') {
            uri.opaque = rest.to_string();
            return Some(uri);
        }

        if let Some(after) = rest.strip_prefix("//") {
            let (authority, path) = match after.find('/') {
                Some(i) => after.split_at(i),
                None => (after, ""),
            };
            let host = match authority.rsplit_once('@') {
                Some((userinfo, host)) => {
                    match userinfo.split_once(':') {
                        Some((user, pass)) => {
                            uri.username = Some(user.to_string());
                            uri.password = Some(pass.to_string());
                        }
                        None => uri.username = Some(userinfo.to_string()),
                    }
                    host
                }
                None => authority,
            };
            uri.host = host.to_string();
            uri.path = path.to_string();
        } else {
            uri.path = rest.to_string();
        }

        Some(uri)
    }

    /// First value for a query key.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Split off a leading `scheme:`. The scheme must start with a letter and
/// continue with letters, digits, `+`, `-` or `.`.
fn split_scheme(spec: &str) -> Option<(&str, &str)> {
    for (i, c) in spec.char_indices() {
        match c {
            'a'..='z' | 'A'..='Z' => {}
            '0'..='9' | '+' | '-' | '.' if i > 0 => {}
            ':' if i > 0 => return Some((&spec[..i], &spec[i + 1..])),
            _ => return None,
        }
    }
    None
}
