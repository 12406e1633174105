pub mod error;
pub mod search;
pub mod store;

pub use error::StoreError;
pub use search::{SearchHit, SearchMatch};
pub use store::{SessionMetadata, SessionStats, SessionStore};
