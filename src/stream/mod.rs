//! Stream Engine
//!
//! The append-only, hash-chained event log and the reconstruction algorithm
//! that linearizes an unordered set of relay-returned events.

pub mod engine;

pub use engine::{find_next_events, linearize, EventStream};
