//! Metadata server lifecycle
//!
//! A [`ServerNode`] owns one server's directory cache, store, request
//! handler and split thread.

pub mod node;
pub mod signals;

pub use node::{NodeError, NodeOptions, ServerNode};
pub use signals::{setup_signal_handlers, shutdown_requested};
