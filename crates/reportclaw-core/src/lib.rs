//! # ReportClaw Core
//!
//! Shared vocabulary for the scheduling, dispatch and job-tree tracking engine:
//! the data model (scheduled items, tasks, log entries), configuration, the
//! error taxonomy and the traits implemented by external delivery transports.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ReportClawConfig;
pub use error::{ReportClawError, Result};
