//! accelet-core: Core types and traits for the accelet resource manager
//!
//! This crate provides the fundamental types used throughout accelet:
//! - Accelerator resources and resource sets
//! - The task abstraction and task identifiers
//! - Events routed through the dispatcher
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod event;
pub mod resource;
pub mod task;

pub use config::*;
pub use error::*;
pub use event::*;
pub use resource::*;
pub use task::*;
