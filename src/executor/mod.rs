//! Local Executors
//!
//! One `LocalExecutor` per lane consumes that lane's channel and runs each
//! task in-process. With remote workers enabled the compute-heavy lane is
//! consumed by the broker instead.
//!
//! Both executors and the broker implement [`CancelCurrent`], the guarded
//! cancellation used by the admin API.

pub mod executor;

pub use executor::LocalExecutor;

use crate::tasks::TaskId;
use async_trait::async_trait;

#[async_trait]
pub trait CancelCurrent: Send + Sync {
    /// Cancels `expected` if, and only if, it is the task currently owned by
    /// this consumer. Returns whether a cancellation was issued.
    async fn cancel_current(&self, expected: TaskId) -> bool;
}

#[cfg(test)]
mod tests;
