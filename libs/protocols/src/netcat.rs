//! `nc:` hops: dial and listen with `nc` over the upstream's command
//! capability. `nc: ssh jump` runs `ssh jump nc %h %p` per connection.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use hopbridge_net::{
    BoxedListener, BoxedStream, BridgeError, Bridger, CommandDialer, CommandTemplate, Dialer, Hop,
    ListenConfig,
};

use crate::command::{opaque_payload, run, CommandListener};

/// Bridger for `nc:` and `netcat:`.
pub struct NetcatBridger;

#[async_trait]
impl Bridger for NetcatBridger {
    async fn bridge(&self, upstream: Hop, address: &str) -> Result<Hop, BridgeError> {
        let command = upstream
            .command
            .clone()
            .ok_or_else(|| BridgeError::MissingCapability {
                scheme: "nc".to_string(),
                capability: "run commands",
            })?;
        let prefix = opaque_payload(address)?;
        let templates = Templates::new(&prefix)
            .map_err(|_| BridgeError::InvalidAddress(address.to_string()))?;

        let hop = Arc::new(NetcatHop { templates, command });
        Ok(Hop::dial_only(hop.clone()).with_listen(hop))
    }
}

struct Templates {
    tcp: CommandTemplate,
    tcp4: CommandTemplate,
    tcp6: CommandTemplate,
    unix: CommandTemplate,
    listen_tcp: CommandTemplate,
    listen_tcp4: CommandTemplate,
    listen_tcp6: CommandTemplate,
    listen_unix: CommandTemplate,
}

impl Templates {
    fn new(prefix: &str) -> io::Result<Self> {
        let with = |cmd: &str| {
            if prefix.is_empty() {
                CommandTemplate::parse(cmd)
            } else {
                CommandTemplate::parse(&format!("{prefix} {cmd}"))
            }
        };
        Ok(Self {
            tcp: with("nc %h %p")?,
            tcp4: with("nc -4 %h %p")?,
            tcp6: with("nc -6 %h %p")?,
            unix: with("nc -U %h")?,
            listen_tcp: with("nc -l %h %p")?,
            listen_tcp4: with("nc -4l %h %p")?,
            listen_tcp6: with("nc -6l %h %p")?,
            listen_unix: with("nc -Ul %h")?,
        })
    }

    fn dial(&self, network: &str) -> &CommandTemplate {
        match network {
            "unix" => &self.unix,
            "tcp4" => &self.tcp4,
            "tcp6" => &self.tcp6,
            _ => &self.tcp,
        }
    }

    fn listen(&self, network: &str) -> &CommandTemplate {
        match network {
            "unix" => &self.listen_unix,
            "tcp4" => &self.listen_tcp4,
            "tcp6" => &self.listen_tcp6,
            _ => &self.listen_tcp,
        }
    }
}

struct NetcatHop {
    templates: Templates,
    command: Arc<dyn CommandDialer>,
}

#[async_trait]
impl Dialer for NetcatHop {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        let argv = self.templates.dial(network).format(network, address);
        run(self.command.as_ref(), &argv).await
    }
}

#[async_trait]
impl ListenConfig for NetcatHop {
    async fn listen(&self, network: &str, address: &str) -> io::Result<BoxedListener> {
        let argv = self.templates.listen(network).format(network, address);
        Ok(Box::new(CommandListener::new(self.command.clone(), argv)))
    }
}
