//! # ReportClaw Scheduler
//!
//! Decides when scheduled report deliveries are due, turns each occurrence
//! into a job tree (one root that computes the report, one child per
//! destination) and keeps an append-only log of every task transition.
//!
//! ## Architecture
//! ```text
//! TriggerEvaluator (tokio interval)
//!   └── due (item, occurrence) ──mpsc──► Dispatcher
//!                                          ├── root: render report   [render lane]
//!                                          └── children, concurrently [deliver lane]
//!                                                ├── email_notify
//!                                                ├── chat_notify
//!                                                └── spreadsheet_export
//! SubmissionService ── AuthorizationGate ──► Dispatcher (on demand, ad-hoc export)
//! LogStore (SQLite) ◄── every transition;  query: history, job trees, overview
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod gate;
pub mod lanes;
pub mod logstore;
pub mod persistence;
pub mod query;
pub mod registry;
pub mod submit;
pub mod trigger;

pub use cron::CronSchedule;
pub use dispatch::{Dispatcher, JobTicket};
pub use engine::SchedulerEngine;
pub use executor::{ExecutionContext, ExecutorRegistry, TaskExecutor};
pub use gate::{AuthorizationGate, RoleGate};
pub use lanes::{Lane, LaneStats, WorkerLanes};
pub use logstore::LogStore;
pub use persistence::SchedulerDb;
pub use query::{JobTree, OverviewRow, TreeHealth};
pub use registry::SchedulerRegistry;
pub use submit::{SubmissionService, SubmitRequest};
pub use trigger::{TriggerEvaluator, TriggerEvent};
