//! Shared test helpers: a scripted timestamper and signed-chain builders.

use async_trait::async_trait;
use std::collections::HashMap;

use es_app::crypto::keys::{generate_keypair, keypair_from_hex};
use es_app::error::{Result, StreamError};
use es_app::event::Event;
use es_app::ots::{Timestamper, Verification};

/// Valid base64 standing in for a detached OTS blob.
pub const MOCK_OTS_BLOB: &str = "bW9jay1vdHM=";

/// A timestamper with scripted outcomes: a default verification, optional
/// per-event overrides, and an optional hard failure mode.
pub struct MockTimestamper {
    default: Verification,
    by_id: HashMap<String, Verification>,
    fail_verify: bool,
}

impl MockTimestamper {
    pub fn pending() -> Self {
        Self {
            default: Verification::Pending,
            by_id: HashMap::new(),
            fail_verify: false,
        }
    }

    pub fn confirmed_at(attested_at: i64) -> Self {
        Self {
            default: Verification::Confirmed { attested_at },
            by_id: HashMap::new(),
            fail_verify: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            default: Verification::Pending,
            by_id: HashMap::new(),
            fail_verify: true,
        }
    }

    pub fn with_override(mut self, id: &str, verification: Verification) -> Self {
        self.by_id.insert(id.to_string(), verification);
        self
    }

    fn lookup(&self, event: &Event) -> Verification {
        self.by_id.get(&event.id).copied().unwrap_or(self.default)
    }
}

#[async_trait]
impl Timestamper for MockTimestamper {
    async fn stamp(&self, _event: &Event) -> Result<String> {
        Ok(MOCK_OTS_BLOB.to_string())
    }

    fn is_upgraded(&self, event: &Event) -> Result<bool> {
        Ok(matches!(self.lookup(event), Verification::Confirmed { .. }))
    }

    async fn upgrade(&self, event: &Event) -> Result<String> {
        match self.lookup(event) {
            Verification::Confirmed { .. } => Ok(MOCK_OTS_BLOB.to_string()),
            Verification::Pending => Err(StreamError::OtsPending),
            Verification::Waiting => Err(StreamError::OtsWaitingConfirmations),
        }
    }

    async fn verify(&self, event: &Event) -> Result<Verification> {
        if self.fail_verify {
            return Err(StreamError::OtsMalformed(format!(
                "scripted failure for event {}",
                event.id
            )));
        }
        Ok(self.lookup(event))
    }

    fn has_rpc_configured(&self) -> bool {
        false
    }
}

/// A stream owner with signing material.
pub struct TestAuthor {
    pub privkey: String,
    pub pubkey: String,
}

pub fn author() -> TestAuthor {
    let (privkey, pubkey) = generate_keypair();
    TestAuthor { privkey, pubkey }
}

/// Build a signed text note carrying the mock OTS blob.
pub fn signed_note(author: &TestAuthor, prev: &str, content: &str, created_at: i64) -> Event {
    let keypair = keypair_from_hex(&author.privkey).unwrap();
    let mut event = Event::new_text_note(
        author.pubkey.clone(),
        prev.to_string(),
        content.to_string(),
        created_at,
    );
    event.sign(&keypair).unwrap();
    event.ots = Some(MOCK_OTS_BLOB.to_string());
    event
}

/// Build a valid chain of `n` signed events starting at genesis.
pub fn signed_chain(author: &TestAuthor, n: usize) -> Vec<Event> {
    let mut events = Vec::new();
    let mut prev = es_app::event::GENESIS.to_string();
    for i in 0..n {
        let event = signed_note(author, &prev, &format!("event {}", i), 1700000000 + i as i64);
        prev = event.id.clone();
        events.push(event);
    }
    events
}
