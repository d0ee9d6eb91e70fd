//! Engine Module
//!
//! Builds every component from an `EngineConfig`, runs their loops under one
//! shutdown token and exposes the combined HTTP router.
//!
//! ## Submodules
//! - **`engine`**: Startup sequence, cancellation routing, shutdown.
//! - **`handlers`**: Cancellation endpoint and router assembly.

pub mod engine;
pub mod handlers;

pub use engine::Engine;
