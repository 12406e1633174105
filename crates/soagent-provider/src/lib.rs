pub mod cli;
pub mod mcp;
pub mod mock;
pub mod verify;

pub use cli::CliProvider;
pub use mcp::McpConfigStore;
pub use mock::{MockProvider, MockResponse};
pub use verify::{verify_provider, VerifyOutcome};
