pub mod bead_store;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod git_runner;
pub mod progress_tracker;
pub mod retry_controller;
pub mod stage_detector;
pub mod types;

pub use bead_store::BeadStore;
pub use config::Config;
pub use error::{Error, Result};
pub use event_bus::EventBus;
pub use progress_tracker::ProgressTracker;
pub use retry_controller::RetryController;
pub use stage_detector::detect_stage;
pub use types::{Bead, BeadStatus, Event, EventKind, Stage, StoreStats};
