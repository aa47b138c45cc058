//! Shared types for the real-time acquisition client
//!
//! This crate contains the data model used throughout the workspace: the
//! sample blocks moved through the ring buffer, the device and connector
//! metadata negotiated with the acquisition server, and the typed measurement
//! values published on the bus.

pub mod data;
pub mod measurement;

// Re-export commonly used types
pub use data::*;
pub use measurement::*;
