//! OpenTimestamps Integration Module
//!
//! Stamps stream events against a remote OTS calendar, upgrades pending
//! attestations to Bitcoin-anchored proofs, and verifies proofs against the
//! blockchain either through a configured Bitcoin Core node or through the
//! blockchain.info explorer fallback.

pub mod bitcoin;
pub mod calendar;
pub mod stamper;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;

pub use bitcoin::BitcoinRpc;
pub use stamper::OtsService;

/// Default public calendar used for stamping.
pub const DEFAULT_CALENDAR: &str = "https://alice.btc.calendar.opentimestamps.org";

/// Outcome of verifying an event's OTS attestation.
///
/// `Pending` and `Waiting` are valid-in-progress states: the proof exists
/// but the calendar has not yet anchored it (or the anchor block lacks
/// confirmations), so the engine accepts the event provisionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Proof anchored in Bitcoin; `attested_at` is the block timestamp.
    Confirmed { attested_at: i64 },
    /// Pending confirmation in the Bitcoin blockchain.
    Pending,
    /// Anchored but waiting for 5 confirmations.
    Waiting,
}

impl Verification {
    pub fn attested_at(&self) -> Option<i64> {
        match self {
            Verification::Confirmed { attested_at } => Some(*attested_at),
            Verification::Pending | Verification::Waiting => None,
        }
    }
}

/// Timestamping contract used by the stream engine.
#[async_trait]
pub trait Timestamper: Send + Sync {
    /// Stamp the event's digest against a calendar, returning the detached
    /// timestamp as a base64 blob.
    async fn stamp(&self, event: &Event) -> Result<String>;

    /// Whether the stored blob already carries a Bitcoin attestation.
    fn is_upgraded(&self, event: &Event) -> Result<bool>;

    /// Fetch Bitcoin-anchored proofs for every pending attestation and merge
    /// them into the stored blob, returning the upgraded base64 blob.
    async fn upgrade(&self, event: &Event) -> Result<String>;

    /// Verify the event's attestation against Bitcoin.
    async fn verify(&self, event: &Event) -> Result<Verification>;

    /// Whether Bitcoin RPC credentials are configured.
    fn has_rpc_configured(&self) -> bool;
}
