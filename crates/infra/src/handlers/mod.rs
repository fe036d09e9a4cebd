//! Reconciliation handlers driven by the work queues.
//!
//! Each handler:
//! - claims the target document through a [`crate::gate::VersionGate`] (load concerns)
//!   or a conditional state transition (messages)
//! - asks the pure rules in `haulage-fleet` what should change
//! - persists the answer with conditional writes keyed off the state it observed
//!
//! A handler that loses a claim or a conditional write does nothing: either the
//! work was already done, or a newer change event will redo it.

pub mod load_route;
pub mod load_status;
pub mod message_dispatch;

use thiserror::Error;

use crate::collaborators::SendError;
use crate::store::StoreError;

pub use load_route::LoadRouteHandler;
pub use load_status::LoadStatusHandler;
pub use message_dispatch::MessageDispatchHandler;

/// Per-invocation handler failure. Logged by the queue with the event identity.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("{0}")]
    Logic(String),
}
