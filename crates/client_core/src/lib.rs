//! Optimistic todo client: a local entity store kept in step with a backend that
//! applies mutations asynchronously.
//!
//! A mutation shows up in the [`EntityStore`] immediately as a placeholder, the
//! [`TodoGateway`] queues it on the backend, and the [`ReconciliationPoller`]
//! keeps reading until the effect is visible. The [`TodoDispatcher`] sequences
//! all of it and rolls the store back when the backend never confirms.

use shared::domain::Todo;

pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod http_gateway;
pub mod placeholder;
pub mod poller;
pub mod session;
pub mod store;

pub use config::{load_settings, ClientSettings};
pub use dispatcher::{CommandOutcome, DispatchError, IgnoreReason, TodoCommand, TodoDispatcher};
pub use gateway::{ErrorClass, GatewayError, TodoGateway};
pub use http_gateway::HttpGateway;
pub use poller::{BackoffPolicy, Expectation, PollFailure, PollOutcome, PollTask, ReconciliationPoller};
pub use session::AuthSession;
pub use store::{EntityStore, StoreEntry};

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The visible list after a store transform.
    TodosChanged(Vec<Todo>),
    /// A user-facing failure message.
    Error(String),
    ErrorCleared,
    /// The backend answered 401 and the stored token was dropped.
    SessionExpired,
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
