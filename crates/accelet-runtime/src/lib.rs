//! accelet-runtime: Task execution for accelet
//!
//! This crate runs what the scheduler decided:
//! - A bounded launcher pool fed by launch and cleanup events
//! - Process-backed tasks running the program configured per workload
//! - Task bookkeeping from submission to a terminal state

pub mod launcher;
pub mod manager;
pub mod process;

pub use launcher::{CallableTask, TaskLauncher, UnitKind};
pub use manager::{TaskManager, TaskRecord};
pub use process::ProcessTask;
