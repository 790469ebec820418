//! # Calls Module
//!
//! The call domain: records and their status machine, the storage seam,
//! and the lifecycle service that drives a call from webhook to terminal
//! status.

pub mod record;      // Call records and the status machine
pub mod repository;  // Storage trait and the in-memory implementation
pub mod service;     // Lifecycle orchestration

pub use repository::InMemoryCallRepository;
pub use service::{CallLifecycleService, CleanupReason};
