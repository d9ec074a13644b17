//! Agent side of both bus channels.
//!
//! The master binds the listeners; the agent connects out.  Both channels
//! frame UTF-8 JSON objects one per line:
//! - subscription: connect to the master's publish listener, read requests;
//! - push: connect to the master's pull listener, write replies.
//!
//! The broadcast channel is lossy by design — anything published before the
//! subscription connects is never seen here.

use fleetbus_protocol::{Reply, Request};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::warn;

/// Errors that can arise on either channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Strip an optional `tcp://` scheme; the bus speaks plain TCP.
pub fn normalize_tcp_addr(url: &str) -> &str {
    url.trim()
        .trim_start_matches("tcp://")
        .trim_end_matches('/')
}

async fn connect(url: &str) -> Result<TcpStream, TransportError> {
    let addr = normalize_tcp_addr(url);
    TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect {
            addr: addr.to_owned(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Subscription (broadcast channel, receiving end)
// ---------------------------------------------------------------------------

/// Lazy stream of broadcast requests.
pub struct Subscription {
    lines: BufReader<OwnedReadHalf>,
    // Write half kept alive so the master's fanout does not see an EOF.
    _write: OwnedWriteHalf,
}

impl Subscription {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (read, write) = connect(url).await?.into_split();
        Ok(Subscription {
            lines: BufReader::new(read),
            _write: write,
        })
    }

    /// Next decodable request, or `None` once the master is gone.
    ///
    /// Undecodable lines are logged and skipped; a malformed publish must
    /// not take the agent down.
    pub async fn next_request(&mut self) -> Result<Option<Request>, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.lines.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            match serde_json::from_str::<Request>(line.trim_end()) {
                Ok(request) => return Ok(Some(request)),
                Err(e) => warn!(error = %e, "skipping undecodable broadcast line"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Push socket (collector channel, sending end)
// ---------------------------------------------------------------------------

/// Append-one-reply connection to the master's pull listener.
pub struct PushSocket {
    stream: TcpStream,
}

impl PushSocket {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        Ok(PushSocket {
            stream: connect(url).await?,
        })
    }

    pub async fn send(&mut self, reply: &Reply) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(reply)?;
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_scheme_and_trailing_slash() {
        assert_eq!(normalize_tcp_addr("tcp://127.0.0.1:1234"), "127.0.0.1:1234");
        assert_eq!(normalize_tcp_addr("127.0.0.1:1234/"), "127.0.0.1:1234");
        assert_eq!(normalize_tcp_addr(" tcp://host:1/ "), "host:1");
    }
}
