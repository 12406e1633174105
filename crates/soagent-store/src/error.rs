#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
