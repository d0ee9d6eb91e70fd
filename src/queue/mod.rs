//! Task Queue Module
//!
//! Accepts new work, keeps the two lanes ordered and feeds their single-slot
//! channels. Also home of the status-change event bus and retention cleanup,
//! since both are driven by queue operations.
//!
//! ## Submodules
//! - **`queue`**: `TaskQueue`, the durable/in-memory pair and the per-lane pumps.
//! - **`lanes`**: Ordered pending set of one lane.
//! - **`events`**: Broadcast fan-out of task updates and removals.
//! - **`retention`**: Trimming of old completed tasks.
//! - **`protocol`** / **`handlers`**: Admin HTTP API.

pub mod events;
pub mod handlers;
pub mod lanes;
pub mod protocol;
pub mod queue;
pub mod retention;

pub use events::{TaskEvent, TaskEvents};
pub use queue::{QueueError, TaskQueue};
pub use retention::RetentionPolicy;
