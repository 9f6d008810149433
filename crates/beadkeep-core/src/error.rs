//! Error taxonomy for the core store and bus.
//!
//! Mirrors the semantic kinds enumerated by the orchestrator design: only
//! [`Error::NotFound`] and [`Error::Storage`] are meant to surface to an
//! external caller. Claim contention and full delivery queues are not
//! errors at all — they are encoded as `None`/silent-drop in the call
//! sites that produce them.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bead not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("git command failed: {0}")]
    GitCommand(String),
}

pub type Result<T> = std::result::Result<T, Error>;
