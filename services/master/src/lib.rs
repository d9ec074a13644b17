// master: Library entry point.
// Exposes modules for integration testing.

pub mod broadcast;
pub mod collector;
pub mod engine;
pub mod http;
pub mod transport;

pub use broadcast::{PublishFanout, PublishHandle};
pub use collector::{Collector, PullListener};
pub use engine::{CollectConfig, Engine, EngineError, MissedBuffer, Quorum};
pub use http::{AppState, build_router};
pub use transport::TransportError;
