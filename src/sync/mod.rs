//! Offline-resilient mutation pipeline: connectivity tracking and the
//! coordinator that ties transport, queue, and cache together.

pub mod connectivity;
pub mod coordinator;

pub use connectivity::{ConnectivityMonitor, ConnectivitySubscription};
pub use coordinator::{DrainSummary, MutationOutcome, SyncCoordinator, SyncEvent};
