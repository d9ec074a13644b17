//! Master side of the broadcast channel.
//!
//! `PublishFanout` listens on a TCP port and forwards every published
//! request, as one JSON line, to all currently-connected subscribers.  No
//! delivery guarantees: a request published before an agent connects is
//! never seen by it, and a subscriber that lags skips missed lines.
//!
//! Multiple simultaneous subscribers are supported.  When a subscriber
//! disconnects it is silently removed; the rest are unaffected.  Publishing
//! with zero subscribers is success.

use crate::transport::{TransportError, normalize_tcp_addr};
use fleetbus_protocol::Request;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info};

// Pending lines per subscriber before the laggard starts skipping.
const FANOUT_CAPACITY: usize = 256;

/// Broadcast listener plus the sending side of its fanout channel.
pub struct PublishFanout {
    listener: TcpListener,
    tx: broadcast::Sender<String>,
}

impl PublishFanout {
    /// Bind the broadcast listener (`"127.0.0.1:0"` lets the OS pick).
    pub async fn bind(url: &str) -> Result<Self, TransportError> {
        let addr = normalize_tcp_addr(url);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        let (tx, _rx) = broadcast::channel(FANOUT_CAPACITY);
        Ok(PublishFanout { listener, tx })
    }

    /// The bound address (useful when port 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// A cloneable publish handle, valid for the fanout's whole lifetime.
    pub fn handle(&self) -> PublishHandle {
        PublishHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run the accept loop; consumes `self` and runs until the listener
    /// fails.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "subscriber connected");
                    let rx = self.tx.subscribe();
                    tokio::spawn(serve_subscriber(stream, rx));
                }
                Err(e) => {
                    info!(error = %e, "broadcast listener closed");
                    break;
                }
            }
        }
    }
}

/// Serialized publish endpoint shared by the engine's workers.
///
/// The fanout channel orders concurrent sends; there is no other
/// master-side write path to subscribers.
#[derive(Clone)]
pub struct PublishHandle {
    tx: broadcast::Sender<String>,
}

impl PublishHandle {
    pub fn publish(&self, request: &Request) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        // Zero subscribers is not an error on a lossy broadcast.
        let _ = self.tx.send(line);
        Ok(())
    }
}

/// Forward every broadcast line to one subscriber until either side ends.
async fn serve_subscriber(mut stream: TcpStream, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if stream.write_all(line.as_bytes()).await.is_err() {
                    // Subscriber disconnected — clean exit.
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "slow subscriber skipped broadcasts");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
