//! Nostr Relay Pool
//!
//! NIP-01 over websockets: subscription filters, the client/relay message
//! codec, per-relay sessions and the fan-out pool used by the stream engine.

pub mod connection;
pub mod filter;
pub mod pool;
pub mod protocol;

pub use connection::Relay;
pub use filter::Filter;
pub use pool::RelayPool;
