pub mod bus;
pub mod handlers;
pub mod orchestrator;
pub mod server;
pub mod sse;

pub use bus::EventBus;
pub use orchestrator::{ChatOrchestrator, OrchestratorError, SendOptions, SendOutcome};
pub use server::{spawn_log_drain, start, AppState, ServerConfig, ServerHandle};
