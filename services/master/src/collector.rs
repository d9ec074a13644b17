//! Master side of the collector channel.
//!
//! `PullListener` accepts agent connections and fans their reply lines *in*:
//! every decoded reply lands on one shared queue, so each reply is consumed
//! exactly once no matter how many agents are connected.  Undecodable lines
//! are logged and skipped — a broken agent must not poison the channel.
//!
//! `Collector` is the consumer half handed to the engine.  It separates
//! *poll* (is something available within this many milliseconds?) from
//! *recv* by parking a polled reply in a one-slot peek buffer, which lets
//! the engine account its deadline between the two steps.

use crate::transport::{TransportError, normalize_tcp_addr};
use fleetbus_protocol::Reply;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const QUEUE_CAPACITY: usize = 1024;

/// Bind the pull listener and return it with its consumer half.
pub async fn bind(url: &str) -> Result<(PullListener, Collector), TransportError> {
    let addr = normalize_tcp_addr(url);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    Ok((
        PullListener { listener, tx },
        Collector { rx, peeked: None },
    ))
}

/// Accept loop for agent push connections.
pub struct PullListener {
    listener: TcpListener,
    tx: mpsc::Sender<Reply>,
}

impl PullListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Run the accept loop; consumes `self` and runs until the listener
    /// fails.  Dropping the loop closes the queue, which aborts any
    /// in-flight engine call.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "agent push connection accepted");
                    tokio::spawn(read_agent(stream, self.tx.clone()));
                }
                Err(e) => {
                    info!(error = %e, "pull listener closed");
                    break;
                }
            }
        }
    }
}

/// Decode one agent connection's reply lines into the shared queue.
async fn read_agent(stream: TcpStream, tx: mpsc::Sender<Reply>) {
    let mut lines = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match lines.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => match serde_json::from_str::<Reply>(line.trim_end()) {
                Ok(reply) => {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "skipping undecodable reply line"),
            },
            Err(e) => {
                debug!(error = %e, "agent push connection lost");
                break;
            }
        }
    }
}

/// Consumer adapter over the shared reply queue.
///
/// A single shared resource: the engine serializes access with a mutex, and
/// one operator request owns it for its whole collection window.
pub struct Collector {
    rx: mpsc::Receiver<Reply>,
    peeked: Option<Reply>,
}

impl Collector {
    /// Bounded-wait poll: true when a reply is available within
    /// `budget_ms`.  The reply is parked for the next `recv`.
    pub async fn poll(&mut self, budget_ms: f64) -> Result<bool, TransportError> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        if budget_ms <= 0.0 {
            return Ok(false);
        }
        // An infinite operator timeout must not overflow the timer; one day
        // per poll round is indistinguishable from forever here.
        let capped_ms = budget_ms.min(86_400_000.0);
        match timeout(Duration::from_secs_f64(capped_ms / 1000.0), self.rx.recv()).await {
            Ok(Some(reply)) => {
                self.peeked = Some(reply);
                Ok(true)
            }
            Ok(None) => Err(TransportError::CollectorClosed),
            Err(_elapsed) => Ok(false),
        }
    }

    /// The parked reply, or the next one off the queue.
    pub async fn recv(&mut self) -> Result<Reply, TransportError> {
        if let Some(reply) = self.peeked.take() {
            return Ok(reply);
        }
        self.rx.recv().await.ok_or(TransportError::CollectorClosed)
    }
}
