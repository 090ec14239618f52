//! The seed hop: this host's own network stack and process table.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use hopbridge_net::{
    BoxedListener, BoxedStream, CommandDialer, Dialer, Hop, ListenConfig, Listener,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// The seed hop every chain starts from. Dials, listens and runs commands
/// locally.
pub fn local() -> Hop {
    let local = Arc::new(Local);
    Hop::dial_only(local.clone())
        .with_listen(local.clone())
        .with_command(local)
}

struct Local;

#[async_trait]
impl Dialer for Local {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        debug!(network, address, "dial");
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = connect_tcp(network, &dial_address(address)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            "unix" => Ok(Box::new(tokio::net::UnixStream::connect(address).await?)),
            _ => Err(unsupported_network(network)),
        }
    }
}

#[async_trait]
impl ListenConfig for Local {
    async fn listen(&self, network: &str, address: &str) -> io::Result<BoxedListener> {
        debug!(network, address, "listen");
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let listener = TcpListener::bind(listen_address(network, address)).await?;
                Ok(Box::new(TcpAcceptor { listener }))
            }
            #[cfg(unix)]
            "unix" => {
                remove_stale_socket(address).await?;
                let listener = tokio::net::UnixListener::bind(address)?;
                Ok(Box::new(UnixAcceptor {
                    listener,
                    path: address.to_string(),
                }))
            }
            _ => Err(unsupported_network(network)),
        }
    }
}

#[async_trait]
impl CommandDialer for Local {
    async fn command_dial(&self, name: &str, args: &[String]) -> io::Result<BoxedStream> {
        debug!(name, ?args, "command dial");
        Ok(Box::new(CommandStream::spawn(name, args)?))
    }
}

fn unsupported_network(network: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("local hop does not support network {network:?}"),
    )
}

/// `:port` means this host when dialing.
fn dial_address(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("127.0.0.1:{port}"),
        None => address.to_string(),
    }
}

/// `:port` means every interface of the requested family when listening.
fn listen_address(network: &str, address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) if network == "tcp6" => format!("[::]:{port}"),
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    }
}

async fn connect_tcp(network: &str, address: &str) -> io::Result<TcpStream> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await?
        .filter(|addr| match network {
            "tcp4" => addr.is_ipv4(),
            "tcp6" => addr.is_ipv6(),
            _ => true,
        })
        .collect();

    let mut last_err = None;
    for addr in candidates {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no {network} addresses for {address}"),
        )
    }))
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
        }
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}

#[cfg(unix)]
struct UnixAcceptor {
    listener: tokio::net::UnixListener,
    path: String,
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixAcceptor {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        let peer = peer
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unix".to_string());
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> String {
        self.path.clone()
    }
}

/// The socket file outlives the listener unless removed, and a leftover one
/// makes the next bind on the path fail.
#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path, error = %err, "failed to remove socket file");
            }
        }
    }
}

/// Remove a socket file left behind by a listener that is gone. A socket
/// something still accepts on is left alone, so the bind reports it busy.
#[cfg(unix)]
async fn remove_stale_socket(path: &str) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let Ok(meta) = tokio::fs::symlink_metadata(path).await else {
        return Ok(());
    };
    if !meta.file_type().is_socket() {
        return Ok(());
    }
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(path, "removing stale socket file");
            match tokio::fs::remove_file(path).await {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            }
        }
        Err(_) => Ok(()),
    }
}

/// A child process whose stdin/stdout form a connection.
///
/// Stderr is inherited. The process is killed when the stream is dropped.
#[derive(Debug)]
pub struct CommandStream {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl CommandStream {
    pub fn spawn(name: &str, args: &[String]) -> io::Result<Self> {
        let mut child = Command::new(name)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// OS process id, while the process is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl AsyncRead for CommandStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for CommandStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            ready!(Pin::new(stdin).poll_flush(cx))?;
        }
        // Closing the pipe is what signals EOF to the child.
        self.stdin = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_port_only_addresses() {
        assert_eq!(dial_address(":8080"), "127.0.0.1:8080");
        assert_eq!(dial_address("example.com:80"), "example.com:80");
        assert_eq!(listen_address("tcp", ":8080"), "0.0.0.0:8080");
        assert_eq!(listen_address("tcp6", ":8080"), "[::]:8080");
        assert_eq!(listen_address("tcp", "127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_local_tcp_listen_and_dial() {
        let hop = local();
        let listener = hop.listen("tcp", "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let (mut conn, _peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = hop.dial("tcp", &addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_network_is_unsupported() {
        let err = local().dial("udp", "127.0.0.1:53").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_relisten_on_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let path = path.to_str().unwrap();

        let first = local().listen("unix", path).await.unwrap();
        drop(first);
        assert!(!std::path::Path::new(path).exists());

        let second = local().listen("unix", path).await.unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _peer) = second.accept().await.unwrap();
            conn.write_all(b"up").await.unwrap();
        });
        let mut conn = local().dial("unix", path).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up");
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listen_replaces_stale_socket_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // a listener that exits without cleaning up leaves the file behind
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let path = path.to_str().unwrap();
        let live = local().listen("unix", path).await.unwrap();
        let err = local().listen("unix", path).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert_eq!(live.local_addr(), path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_stream_echoes_through_cat() {
        let mut conn = local().dial("cmd", "cat").await.unwrap();
        conn.write_all(b"through a process").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"through a process");
    }
}
