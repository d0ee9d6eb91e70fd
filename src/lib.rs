//! Manga Task Engine Library
//!
//! Background task engine for a manga library server: folder scans and
//! library maintenance run locally, chapter upscaling runs locally or on
//! remote workers that lease tasks over HTTP.
//!
//! ## Architecture Modules
//!
//! - **`tasks`**: Task records, the status state machine, payload kinds and the
//!   environment seam they execute against.
//! - **`store`**: Durable storage contract with SQLite and in-memory backends.
//! - **`queue`**: Dual-lane queue with single-slot channels, recovery/replay,
//!   admin operations, the status event bus and retention cleanup.
//! - **`executor`**: One local consumer loop per lane.
//! - **`broker`**: Lease table, distribution and reaper for remote workers.
//! - **`transfer`**: Worker RPC surface, chunked file transfer, worker client and loop.
//! - **`registry`**: Live, sorted read model fed by the event bus.
//! - **`config`** / **`engine`**: Configuration and the wiring of everything above.

pub mod broker;
pub mod config;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod store;
pub mod tasks;
pub mod transfer;
