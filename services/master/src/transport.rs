//! Shared plumbing for the master's two bus listeners.

/// Errors that can arise from the broadcast or collector adapters.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    /// The pull listener's accept loop is gone; nothing can arrive anymore.
    #[error("collector channel closed")]
    CollectorClosed,
}

/// Strip an optional `tcp://` scheme; the bus speaks plain TCP.
pub fn normalize_tcp_addr(url: &str) -> &str {
    url.trim()
        .trim_start_matches("tcp://")
        .trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_scheme() {
        assert_eq!(normalize_tcp_addr("tcp://0.0.0.0:1234"), "0.0.0.0:1234");
        assert_eq!(normalize_tcp_addr("127.0.0.1:9"), "127.0.0.1:9");
    }
}
