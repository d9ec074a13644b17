//! Broadcast/collect engine.
//!
//! One operation shape serves the whole HTTP surface: publish a correlated
//! request (or skip the publish for poll-only calls), then pull replies off
//! the collector until the quorum is met or the deadline runs out.  Replies
//! correlated to some *other* request are never discarded — they are filed
//! in the caller's missed buffer under their own id, to be reclaimed by a
//! later collect for that id or drained via the `missed` operation.
//!
//! The collector is a single shared resource: callers take turns owning it
//! for their whole window.  Deadlines are the only cancellation mechanism.

use crate::broadcast::PublishHandle;
use crate::collector::Collector;
use crate::transport::TransportError;
use fleetbus_protocol::{Reply, Request, number};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Late replies, keyed by their own correlation id, in arrival order.
pub type MissedBuffer = HashMap<String, Vec<Reply>>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// Collection policy
// ---------------------------------------------------------------------------

/// Upper bound on replies collected per call.
///
/// `All` is the operator's `+Inf`: drain the full timeout window.  Strict
/// JSON has no Infinity literal, so `All` serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    Count(u64),
    All,
}

impl Quorum {
    /// True while `have` collected replies do not yet satisfy the bound.
    pub fn wants_more(self, have: usize) -> bool {
        match self {
            Quorum::Count(n) => (have as u64) < n,
            Quorum::All => true,
        }
    }

    fn from_f64(value: f64) -> Quorum {
        if value.is_infinite() {
            Quorum::All
        } else {
            Quorum::Count(value.max(0.0) as u64)
        }
    }
}

impl Serialize for Quorum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Quorum::Count(n) => serializer.serialize_u64(*n),
            Quorum::All => serializer.serialize_none(),
        }
    }
}

/// Per-call `(timeout, quorum)` policy.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CollectConfig {
    /// Collection window in milliseconds.
    pub timeout: f64,
    /// Reply quorum; reaching it ends the window early.
    pub agents: Quorum,
}

impl Default for CollectConfig {
    fn default() -> Self {
        CollectConfig {
            timeout: 1000.0,
            agents: Quorum::All,
        }
    }
}

impl CollectConfig {
    /// This config with any `timeout`/`agents` fields of `params` applied.
    /// Unparseable values are ignored.
    pub fn overridden(self, params: &Map<String, Value>) -> CollectConfig {
        CollectConfig {
            timeout: params
                .get("timeout")
                .and_then(number)
                .unwrap_or(self.timeout),
            agents: params
                .get("agents")
                .and_then(number)
                .map_or(self.agents, Quorum::from_f64),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    publish: PublishHandle,
    collector: Mutex<Collector>,
    last_req_id: std::sync::Mutex<Option<String>>,
}

impl Engine {
    pub fn new(publish: PublishHandle, collector: Collector) -> Self {
        Engine {
            publish,
            collector: Mutex::new(collector),
            last_req_id: std::sync::Mutex::new(None),
        }
    }

    /// The most recently minted correlation id, engine-wide.
    pub fn last_req_id(&self) -> Option<String> {
        self.last_req_id.lock().expect("mutex poisoned").clone()
    }

    /// Mint an id, stamp and publish the request, then collect its replies.
    /// Returns the minted id alongside the (possibly short) reply list.
    pub async fn send_and_collect(
        &self,
        mut request: Request,
        config: CollectConfig,
        missed: &mut MissedBuffer,
    ) -> Result<(String, Vec<Reply>), EngineError> {
        let req_id = Uuid::new_v4().to_string();
        request.req = Some(req_id.clone());
        self.publish.publish(&request)?;
        *self.last_req_id.lock().expect("mutex poisoned") = Some(req_id.clone());
        debug!(req_id = %req_id, action = request.action.as_deref().unwrap_or(""), "request published");

        let replies = self.collect(Some(&req_id), config, missed).await?;
        Ok((req_id, replies))
    }

    /// Collect replies for `req_id` under `config`, without publishing.
    ///
    /// The working queue starts from whatever the missed buffer already
    /// holds for this id.  Wall clock is read once at start and after each
    /// receive; the poll budget never exceeds the remaining window.  With
    /// `req_id = None` every reply files as missed.
    pub async fn collect(
        &self,
        req_id: Option<&str>,
        config: CollectConfig,
        missed: &mut MissedBuffer,
    ) -> Result<Vec<Reply>, EngineError> {
        let mut queue = req_id
            .and_then(|id| missed.remove(id))
            .unwrap_or_default();
        let start = Instant::now();

        let mut collector = self.collector.lock().await;
        while config.agents.wants_more(queue.len()) {
            let remaining = config.timeout - start.elapsed().as_secs_f64() * 1000.0;
            if remaining <= 0.0 {
                break;
            }
            if !collector.poll(remaining).await? {
                break;
            }
            let reply = collector.recv().await?;
            if req_id == Some(reply.req.as_str()) {
                queue.push(reply);
            } else {
                missed.entry(reply.req.clone()).or_default().push(reply);
            }
        }
        Ok(queue)
    }

    /// Drain the collector into the missed buffer for the whole window.
    pub async fn drain_missed(
        &self,
        config: CollectConfig,
        missed: &mut MissedBuffer,
    ) -> Result<(), EngineError> {
        let leftovers = self.collect(None, config, missed).await?;
        debug_assert!(leftovers.is_empty());
        Ok(())
    }
}
