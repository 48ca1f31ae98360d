//! accelet-scheduler: Fair accelerator scheduler for accelet
//!
//! This crate decides which pending task runs on which accelerator core:
//! - Accelerator card bookkeeping (total and used capability)
//! - Hierarchical queues with fair-share ordering
//! - The scheduling pass and its heartbeat loop

pub mod accelerator;
pub mod fair;
pub mod queue;
pub mod schedulable;

pub use accelerator::{Accelerator, AcceleratorReport};
pub use fair::FairScheduler;
pub use queue::{QueueLength, QueueManager, SchedulableQueue, ROOT_QUEUE};
pub use schedulable::SchedulableTask;
