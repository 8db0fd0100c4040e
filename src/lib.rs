//! Distributed background job scheduler for the document management system.
//!
//! This library exposes the internal modules for the binary and for testing.

pub mod config;
pub mod job_store;
pub mod metrics;
pub mod scheduler;
pub mod sqlite_persistence;
pub mod tasks;
