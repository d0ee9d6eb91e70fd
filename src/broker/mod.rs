//! Remote work distribution for the compute-heavy lane: request semaphore,
//! lease table and the dead-lease reaper.

pub mod broker;

pub use broker::{Lease, LeasePolicy, RemoteWorkBroker};

#[cfg(test)]
mod tests;
