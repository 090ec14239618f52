//! Test doubles for chain and dialer tests.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hopbridge_net::{BoxedStream, BridgeError, Bridger, Dialer, Hop};

/// Network name that makes a [`Labelled`] dialer report its label.
const WHOAMI: &str = "whoami";

/// Records bridge and dial calls made through its doubles. Dials reaching
/// the seed are not recorded.
///
/// Hop specifiers containing `down` build fine but refuse every dial;
/// specifiers containing `invalid` fail to build.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The innermost hop, labelled `seed`.
    pub(crate) fn seed(&self) -> Hop {
        Hop::dial_only(Arc::new(Labelled {
            label: "seed".into(),
            upstream: None,
            calls: self.calls.clone(),
        }))
    }

    pub(crate) fn bridger(&self, name: &str) -> Arc<dyn Bridger> {
        Arc::new(RecordingBridger {
            name: name.to_string(),
            calls: self.calls.clone(),
        })
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Only the `dial ...` entries.
    pub(crate) fn dials(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("dial "))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// Label of the dialer inside `hop`, if it is one of ours.
pub(crate) async fn label(hop: &Hop) -> String {
    match hop.dialer.dial(WHOAMI, "").await {
        Err(err) => err.to_string(),
        Ok(_) => "unknown".into(),
    }
}

struct RecordingBridger {
    name: String,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Bridger for RecordingBridger {
    async fn bridge(&self, upstream: Hop, address: &str) -> Result<Hop, BridgeError> {
        let below = label(&upstream).await;
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {address} <- {below}", self.name));
        if address.contains("invalid") {
            return Err(BridgeError::InvalidAddress(address.into()));
        }
        Ok(Hop::dial_only(Arc::new(Labelled {
            label: address.to_string(),
            upstream: Some(upstream),
            calls: self.calls.clone(),
        })))
    }
}

struct Labelled {
    label: String,
    upstream: Option<Hop>,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Dialer for Labelled {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        if network == WHOAMI {
            return Err(io::Error::other(self.label.clone()));
        }
        if self.upstream.is_some() {
            self.calls
                .lock()
                .unwrap()
                .push(format!("dial {address} via {}", self.label));
        }
        if self.label.contains("down") {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} is down", self.label),
            ));
        }
        if let Some(upstream) = &self.upstream {
            upstream.dial(network, &self.label).await?;
        }
        let (conn, _peer) = tokio::io::duplex(64);
        Ok(Box::new(conn))
    }
}
