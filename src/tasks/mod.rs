//! Task Records and Payloads
//!
//! The persisted unit of work and everything needed to run it.
//!
//! ## Submodules
//! - **`types`**: `TaskRecord`, its identity, lane and status state machine.
//! - **`payload`**: The closed set of task kinds and the single dispatch point that runs them.
//! - **`context`**: Per-execution handle carrying the cancellation token and progress sink.
//! - **`environment`**: The injected collaborator seam (files, profiles, upscaler, reader server).

pub mod context;
pub mod environment;
pub mod payload;
pub mod types;

pub use context::{ProgressFn, TaskContext};
pub use environment::{CommandEnvironment, TaskEnvironment, UpscalerProfile};
pub use payload::TaskPayload;
pub use types::{Lane, TaskId, TaskProgress, TaskRecord, TaskStatus, now_ms};

#[cfg(test)]
pub(crate) mod testing;
