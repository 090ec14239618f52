//! `cmd:` hops: every dial runs a command template through the upstream's
//! command capability, with `%h`/`%p` replaced by the target.
//!
//! `cmd: ssh jump nc %h %p` reaches any target that `jump` can reach.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use hopbridge_net::{
    BoxedListener, BoxedStream, BridgeError, Bridger, CommandDialer, CommandTemplate, Dialer, Hop,
    HopUri, ListenConfig, Listener, UnreadStream,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Bridger for `cmd:` and `command:`.
pub struct CommandBridger;

#[async_trait]
impl Bridger for CommandBridger {
    async fn bridge(&self, upstream: Hop, address: &str) -> Result<Hop, BridgeError> {
        let command = upstream
            .command
            .clone()
            .ok_or_else(|| BridgeError::MissingCapability {
                scheme: "cmd".to_string(),
                capability: "run commands",
            })?;
        let line = opaque_payload(address)?;
        let template = CommandTemplate::parse(&line)
            .map_err(|_| BridgeError::InvalidAddress(address.to_string()))?;

        let hop = Arc::new(CommandHop {
            template,
            command: command.clone(),
        });
        Ok(Hop::dial_only(hop.clone())
            .with_listen(hop)
            .with_command(command))
    }
}

/// The opaque part of a `scheme:opaque` specifier, trimmed. A query or
/// fragment is not part of it, so `nc:?` carries nothing.
pub(crate) fn opaque_payload(address: &str) -> Result<String, BridgeError> {
    let uri =
        HopUri::parse(address).ok_or_else(|| BridgeError::InvalidAddress(address.to_string()))?;
    Ok(uri.opaque.trim().to_string())
}

struct CommandHop {
    template: CommandTemplate,
    command: Arc<dyn CommandDialer>,
}

#[async_trait]
impl Dialer for CommandHop {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        let argv = self.template.format(network, address);
        run(self.command.as_ref(), &argv).await
    }
}

#[async_trait]
impl ListenConfig for CommandHop {
    async fn listen(&self, network: &str, address: &str) -> io::Result<BoxedListener> {
        let argv = self.template.format(network, address);
        Ok(Box::new(CommandListener::new(self.command.clone(), argv)))
    }
}

pub(crate) async fn run(command: &dyn CommandDialer, argv: &[String]) -> io::Result<BoxedStream> {
    let (name, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    debug!(command = %argv.join(" "), "run");
    command.command_dial(name, args).await
}

/// Accepts by running a listening command (`nc -l ...`) and waiting for it
/// to produce output.
///
/// A command gives no signal that a peer connected other than data, so an
/// accept completes only after the first byte arrives. That byte is pushed
/// back onto the stream. Accepts are serialized.
pub(crate) struct CommandListener {
    command: Arc<dyn CommandDialer>,
    argv: Vec<String>,
    accepting: Mutex<()>,
}

impl CommandListener {
    pub(crate) fn new(command: Arc<dyn CommandDialer>, argv: Vec<String>) -> Self {
        Self {
            command,
            argv,
            accepting: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Listener for CommandListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let _guard = self.accepting.lock().await;
        let conn = run(self.command.as_ref(), &self.argv).await?;
        let mut conn = UnreadStream::new(conn);
        if conn.peek(1).await?.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "listening command exited without a connection",
            ));
        }
        Ok((Box::new(conn), self.local_addr()))
    }

    fn local_addr(&self) -> String {
        format!("cmd:{}", self.argv.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Records every command and answers with its argv joined by spaces.
    #[derive(Default)]
    struct EchoArgv {
        calls: StdMutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandDialer for EchoArgv {
        async fn command_dial(&self, name: &str, args: &[String]) -> io::Result<BoxedStream> {
            let mut argv = vec![name.to_string()];
            argv.extend(args.iter().cloned());
            let (mut ours, theirs) = tokio::io::duplex(256);
            ours.write_all(argv.join(" ").as_bytes()).await?;
            self.calls.lock().unwrap().push(argv);
            tokio::spawn(async move {
                // keep the pipe open until the reader goes away
                let mut sink = Vec::new();
                let _ = ours.read_to_end(&mut sink).await;
            });
            Ok(Box::new(theirs))
        }
    }

    struct NoDial;

    #[async_trait]
    impl Dialer for NoDial {
        async fn dial(&self, _network: &str, _address: &str) -> io::Result<BoxedStream> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn upstream(commands: Arc<EchoArgv>) -> Hop {
        Hop::dial_only(Arc::new(NoDial)).with_command(commands)
    }

    #[tokio::test]
    async fn test_dial_formats_template() {
        let commands = Arc::new(EchoArgv::default());
        let hop = CommandBridger
            .bridge(upstream(commands.clone()), "cmd: ssh jump nc %h %p")
            .await
            .unwrap();

        let mut conn = hop.dial("tcp", "db.internal:5432").await.unwrap();
        let expected = b"ssh jump nc db.internal 5432";
        let mut buf = vec![0u8; expected.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);

        assert_eq!(commands.calls.lock().unwrap().len(), 1);
        assert!(hop.listen.is_some());
        assert!(hop.command.is_some());
    }

    #[tokio::test]
    async fn test_requires_command_capability() {
        let err = CommandBridger
            .bridge(Hop::dial_only(Arc::new(NoDial)), "cmd: nc %h %p")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingCapability { .. }));
    }

    #[tokio::test]
    async fn test_rejects_empty_and_unbalanced_commands() {
        let commands = Arc::new(EchoArgv::default());
        for spec in ["cmd:", "cmd: nc 'oops"] {
            let err = CommandBridger
                .bridge(upstream(commands.clone()), spec)
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::InvalidAddress(_)), "{spec}");
        }
    }

    #[tokio::test]
    async fn test_listener_pushes_back_first_byte() {
        let commands = Arc::new(EchoArgv::default());
        let listener = CommandListener::new(
            commands.clone(),
            vec!["nc".into(), "-l".into(), "8080".into()],
        );
        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, "cmd:nc -l 8080");
        let expected = b"nc -l 8080";
        let mut buf = vec![0u8; expected.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }
}
