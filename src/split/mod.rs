//! Partition splitting
//!
//! Request handlers detect oversized partitions and push a [`SplitTask`];
//! one split thread per server drains the [`SplitTaskQueue`] through the
//! [`SplitCoordinator`].

pub mod coordinator;
pub mod queue;

pub use coordinator::{SkipReason, SplitCoordinator, SplitError, SplitOutcome, SplitResult};
pub use queue::{SplitTask, SplitTaskQueue};
