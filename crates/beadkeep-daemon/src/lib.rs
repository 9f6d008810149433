pub mod daemon;
pub mod error;
pub mod shutdown;

pub use daemon::{Daemon, DaemonIntervals};
pub use error::{Error, Result};
pub use shutdown::ShutdownSignal;
