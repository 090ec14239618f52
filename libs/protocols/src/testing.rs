//! In-memory peers for protocol tests.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hopbridge_net::{BoxedStream, Dialer, Hop, ProxyHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Answers every dial with an echo peer and records the requested targets.
#[derive(Default)]
pub(crate) struct EchoDialer {
    pub(crate) targets: Mutex<Vec<String>>,
}

#[async_trait]
impl Dialer for EchoDialer {
    async fn dial(&self, _network: &str, address: &str) -> io::Result<BoxedStream> {
        self.targets.lock().unwrap().push(address.to_string());
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(ours);
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = w.shutdown().await;
        });
        Ok(Box::new(theirs))
    }
}

/// Every dial lands on a fresh connection served by `server`.
pub(crate) struct ServerDialer {
    pub(crate) server: Arc<dyn ProxyHandler>,
}

#[async_trait]
impl Dialer for ServerDialer {
    async fn dial(&self, _network: &str, _address: &str) -> io::Result<BoxedStream> {
        let (ours, theirs) = tokio::io::duplex(4096);
        let server = self.server.clone();
        tokio::spawn(async move {
            if let Ok(Some(mut negotiated)) = server.negotiate(Box::new(theirs)).await {
                let _ =
                    tokio::io::copy_bidirectional(&mut negotiated.client, &mut negotiated.upstream)
                        .await;
            }
        });
        Ok(Box::new(ours))
    }
}

/// A hop whose dials are served by `server`.
pub(crate) fn served_by(server: impl ProxyHandler + 'static) -> Hop {
    Hop::dial_only(Arc::new(ServerDialer {
        server: Arc::new(server),
    }))
}

/// Write `payload` and read the same number of bytes back.
pub(crate) async fn echo(conn: &mut BoxedStream, payload: &[u8]) -> Vec<u8> {
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    buf
}
