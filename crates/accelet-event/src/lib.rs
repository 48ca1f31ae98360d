//! accelet-event: In-process event routing for accelet
//!
//! Components never call each other directly; they publish [`Event`]s on an
//! [`AsyncDispatcher`] which hands them, one at a time and in order, to the
//! [`EventHandler`]s registered for the event's type.
//!
//! [`Event`]: accelet_core::Event

pub mod dispatcher;
pub mod handler;

pub use dispatcher::{AsyncDispatcher, EventPublisher, FailureHook};
pub use handler::{EventHandler, MultiListenerHandler};
