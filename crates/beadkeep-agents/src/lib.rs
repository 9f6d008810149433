pub mod error;
pub mod notification;
pub mod registry;
pub mod supervisor;
pub mod watchdog;
pub mod worker_driver;

pub use error::{Result, SupervisorError};
pub use notification::NotificationSink;
pub use registry::{AgentRegistration, AgentRegistry};
pub use supervisor::{AgentSupervisor, Outcome, SupervisorConfig, WorkerTemplate};
pub use watchdog::Watchdog;
pub use worker_driver::{DriverError, ExternalWorkerDriver, WaitOutcome, WorkerHandle};
