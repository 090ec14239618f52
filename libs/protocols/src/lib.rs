//! Hop plugins for hopbridge.
//!
//! Every plugin is a [`Bridger`] registered under one or more scheme names,
//! plus the proxy-server handlers the reverse-proxy mode dispatches to:
//! - `local`: the seed hop (TCP/Unix dial and listen, local command exec)
//! - `cmd:` / `command:`: run a `%h`/`%p` command template per dial
//! - `nc:` / `netcat:`: `nc` over the upstream's command capability
//! - `socks4`, `socks4a`, `socks5`, `socks5h`, `http`: proxy clients and servers

use std::sync::Arc;

use hopbridge_net::Bridger;

pub mod command;
pub mod error;
pub mod http;
pub mod local;
pub mod netcat;
pub mod socks4;
pub mod socks5;

mod addr;
#[cfg(test)]
mod testing;

pub use command::CommandBridger;
pub use error::ProtocolError;
pub use http::{HttpBridger, HttpServer};
pub use local::{local, CommandStream};
pub use netcat::NetcatBridger;
pub use socks4::{Socks4Bridger, Socks4Server};
pub use socks5::{Credentials, Socks5Bridger, Socks5Server};

/// Every built-in bridger with the schemes it answers to.
pub fn bridgers() -> Vec<(&'static str, Arc<dyn Bridger>)> {
    let socks4: Arc<dyn Bridger> = Arc::new(Socks4Bridger);
    let socks5: Arc<dyn Bridger> = Arc::new(Socks5Bridger);
    let netcat: Arc<dyn Bridger> = Arc::new(NetcatBridger);
    let command: Arc<dyn Bridger> = Arc::new(CommandBridger);
    vec![
        ("socks4", socks4.clone()),
        ("socks4a", socks4),
        ("socks5", socks5.clone()),
        ("socks5h", socks5),
        ("http", Arc::new(HttpBridger)),
        ("nc", netcat.clone()),
        ("netcat", netcat),
        ("cmd", command.clone()),
        ("command", command),
    ]
}
