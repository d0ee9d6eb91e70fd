//! Live Registry Module
//!
//! Read-only, always-current view of every task, fed by the queue's event
//! bus. Serves the listing and stats endpoints; never used for scheduling.
//!
//! ## Submodules
//! - **`registry`**: `LiveRegistry` and its event loop.
//! - **`handlers`**: Listing, lookup and stats handlers.

pub mod handlers;
pub mod registry;

pub use registry::{LiveRegistry, TaskStats};
