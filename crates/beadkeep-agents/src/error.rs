#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] beadkeep_core::Error),
    #[error("worker launch failed: {0}")]
    WorkerLaunch(String),
    #[error("worker timed out")]
    WorkerTimeout,
    #[error("worker exited with failure: {0}")]
    WorkerFailure(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
