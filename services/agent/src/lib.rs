// agent: Library entry point.
// Exposes modules for integration testing.

pub mod dispatcher;
pub mod executor;
pub mod transport;

pub use dispatcher::{AgentState, Dispatcher, HandlerError};
pub use transport::{PushSocket, Subscription, TransportError};

use tracing::info;

/// Connect both channels and run the dispatch loop until the broadcast
/// stream ends.
///
/// This is the whole agent: `main` calls it with CLI arguments, integration
/// tests call it with in-process listener addresses.
pub async fn run(
    subscribe_url: &str,
    push_url: &str,
    agent_id: String,
) -> Result<(), TransportError> {
    let subscription = Subscription::connect(subscribe_url).await?;
    let push = PushSocket::connect(push_url).await?;
    info!(agent_id = %agent_id, subscribe_url, push_url, "agent connected");

    let state = AgentState::new(agent_id);
    let dispatcher = Dispatcher::new();
    dispatcher.run_loop(subscription, push, state).await
}
