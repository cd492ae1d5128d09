//! Append-only event streams.
//!
//! Every append enforces the full invariant set: the event is authored by
//! the stream owner, its signature verifies, its `prev` tag points at the
//! current head, it carries an OTS attestation, and that attestation either
//! verifies against Bitcoin or is still in flight at the calendar. A failed
//! append leaves the stream untouched.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::crypto::keys::keypair_from_hex;
use crate::error::{Result, StreamError};
use crate::event::{Event, GENESIS};
use crate::ots::Timestamper;
use crate::relay::{Filter, RelayPool};

/// An owned or followed event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStream {
    pub name: String,
    pub pubkey: String,
    /// Present iff the local user owns the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privkey: Option<String>,
    /// Relays this stream can be fetched from and pushed to.
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub log: Vec<Event>,
}

impl EventStream {
    pub fn new(name: String, pubkey: String, privkey: Option<String>) -> Self {
        Self {
            name,
            pubkey,
            privkey,
            relays: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.log.len()
    }

    pub fn is_owned(&self) -> bool {
        self.privkey.is_some()
    }

    /// Recompute the head from the log: walk the `prev -> id` map forward
    /// from the genesis sentinel until no successor remains.
    pub fn head(&self) -> String {
        let mut prev_to_id = HashMap::new();
        for event in &self.log {
            prev_to_id.insert(event.prev(), event.id.clone());
        }

        let mut head = GENESIS.to_string();
        // The walk is bounded by the log length, so a corrupted log with a
        // reference cycle cannot spin forever.
        for _ in 0..self.log.len() {
            match prev_to_id.get(&head) {
                Some(next) => head = next.clone(),
                None => break,
            }
        }
        head
    }

    /// Create, sign, stamp and append a new text note. Fails with
    /// `ReadOnly` on followed streams; a create that fails validation
    /// leaves the stream unchanged.
    pub async fn create(&mut self, content: &str, ts: &dyn Timestamper) -> Result<Event> {
        let privkey = self.privkey.as_deref().ok_or(StreamError::ReadOnly)?;
        let keypair = keypair_from_hex(privkey)?;

        let mut event = Event::new_text_note(
            self.pubkey.clone(),
            self.head(),
            content.to_string(),
            Utc::now().timestamp(),
        );
        event.sign(&keypair)?;
        event.ots = Some(ts.stamp(&event).await?);

        self.append(event.clone(), ts).await?;
        Ok(event)
    }

    /// Append a candidate event after validating the full invariant set.
    pub async fn append(&mut self, event: Event, ts: &dyn Timestamper) -> Result<()> {
        if event.pubkey != self.pubkey {
            return Err(StreamError::WrongAuthor {
                expected: self.pubkey.clone(),
                found: event.pubkey.clone(),
            });
        }

        event.verify()?;

        let expected_prev = match self.log.last() {
            Some(last) => last.id.clone(),
            None => GENESIS.to_string(),
        };
        let prev = event.prev();
        if prev != expected_prev {
            return Err(StreamError::ChainBreak {
                id: event.id.clone(),
                expected: expected_prev,
                found: prev,
            });
        }

        if event.ots.as_deref().unwrap_or_default().is_empty() {
            return Err(StreamError::MissingOts(event.id.clone()));
        }

        // Pending and Waiting are acceptable: a freshly stamped event may be
        // appended before block inclusion.
        let verification = ts.verify(&event).await?;

        if let (Some(attested), Some(last)) = (verification.attested_at(), self.log.last()) {
            // The bar here is the predecessor's author-claimed time; the
            // verify pass holds attested times against each other.
            if attested < last.created_at {
                return Err(StreamError::NonlinearAttestation {
                    id: event.id.clone(),
                    attested,
                    reference: last.created_at,
                });
            }
        }

        debug!("appending event {} to stream {}", event.id, self.name);
        self.log.push(event);
        Ok(())
    }

    /// Sync the stream to its remote head: repeatedly reconstruct the next
    /// chain suffix from the pool and append it. The successfully appended
    /// prefix survives a failing event; callers persist before surfacing
    /// the error.
    pub async fn sync(&mut self, pool: &RelayPool, ts: &dyn Timestamper) -> Result<usize> {
        info!("syncing {} ...", self.name);
        let mut appended = 0;
        let mut prev = self.head();

        loop {
            let events = find_next_events(pool, &self.pubkey, &prev).await?;
            if events.is_empty() {
                break;
            }
            for event in events {
                let id = event.id.clone();
                self.append(event, ts).await?;
                appended += 1;
                prev = id;
            }
        }

        info!("synced {}, HEAD at {}", self.name, self.head());
        Ok(appended)
    }

    /// Add a relay to the stream-scoped set.
    pub fn add_relay(&mut self, url: &str) -> Result<()> {
        if self.relays.iter().any(|existing| existing == url) {
            return Err(StreamError::AlreadyAdded(url.to_string()));
        }
        self.relays.push(url.to_string());
        Ok(())
    }

    /// Remove a relay from the stream-scoped set.
    pub fn remove_relay(&mut self, url: &str) -> Result<()> {
        if !self.relays.iter().any(|existing| existing == url) {
            return Err(StreamError::NotFound(url.to_string()));
        }
        self.relays.retain(|existing| existing != url);
        Ok(())
    }

    pub fn list_relays(&self) -> &[String] {
        &self.relays
    }

    pub fn has_relays(&self) -> bool {
        !self.relays.is_empty()
    }

    /// Upgrade every event whose attestation is still pending, merging the
    /// Bitcoin-anchored proof into the stored blob. Per-event failures are
    /// logged and skipped so one stuck calendar cannot block the rest.
    pub async fn ots_upgrade(&mut self, ts: &dyn Timestamper) -> Result<usize> {
        let mut upgraded = 0;
        for event in &mut self.log {
            match ts.is_upgraded(event) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("skipping event {}: {}", event.id, e);
                    continue;
                }
            }
            match ts.upgrade(event).await {
                Ok(blob) => {
                    event.ots = Some(blob);
                    upgraded += 1;
                    info!("upgraded OTS for event {}", event.id);
                }
                Err(StreamError::OtsPending) => {
                    info!("event {} still pending confirmation", event.id)
                }
                Err(StreamError::OtsWaitingConfirmations) => {
                    info!("event {} waiting for 5 confirmations", event.id)
                }
                Err(e) => warn!("could not upgrade event {}: {}", event.id, e),
            }
        }
        Ok(upgraded)
    }

    /// Verify every event's attestation, enforcing that confirmed attested
    /// times never regress along the chain.
    pub async fn ots_verify(
        &self,
        ts: &dyn Timestamper,
    ) -> Result<Vec<(String, crate::ots::Verification)>> {
        let mut results = Vec::new();
        let mut last_attested: Option<i64> = None;
        for event in &self.log {
            let verification = ts.verify(event).await?;
            if let Some(attested) = verification.attested_at() {
                if let Some(reference) = last_attested {
                    if attested < reference {
                        return Err(StreamError::NonlinearAttestation {
                            id: event.id.clone(),
                            attested,
                            reference,
                        });
                    }
                }
                last_attested = Some(attested);
            }
            results.push((event.id.clone(), verification));
        }
        Ok(results)
    }

    /// Add `url` to the stream's relay set and publish the whole log to
    /// that single relay for clone distribution.
    pub async fn mirror(&mut self, pool: &RelayPool, url: &str) -> Result<()> {
        match self.add_relay(url) {
            Ok(()) | Err(StreamError::AlreadyAdded(_)) => {}
            Err(e) => return Err(e),
        }
        for event in &self.log {
            pool.send(url, event).await?;
        }
        info!("mirrored {} events of {} to {}", self.log.len(), self.name, url);
        Ok(())
    }

    /// Publish the whole log to the given relays.
    pub async fn publish_log(&self, pool: &RelayPool, urls: &[String]) -> Result<()> {
        for event in &self.log {
            pool.broadcast(urls, event).await?;
        }
        Ok(())
    }

    /// ASCII rendering of the chain from genesis to head.
    pub fn render_chain(&self) -> String {
        let indent = "\t\t\t";
        let mut out = format!("{} ({})\n\nEvent stream:\n\n{}{}", self.name, self.pubkey, indent, GENESIS);
        for event in &self.log {
            out.push_str(&format!("\n{}|\n{}v\n{}", indent, indent, event.id));
        }
        out
    }
}

/// Reconstruct the forward chain suffix following `prev` from the pool's
/// view of an author's events.
pub async fn find_next_events(pool: &RelayPool, pubkey: &str, prev: &str) -> Result<Vec<Event>> {
    let filter = Filter::new().authors(vec![pubkey.to_string()]);
    let events = pool.query_pool(&filter).await?;
    linearize(events, prev)
}

/// Deterministically linearize an unordered candidate set into the chain
/// suffix starting at `from`. Two distinct events claiming the same `prev`
/// are a fork and fail the whole reconstruction; duplicate ids for the same
/// `prev` collapse (union-of-relays property).
pub fn linearize(events: Vec<Event>, from: &str) -> Result<Vec<Event>> {
    let mut by_prev: HashMap<String, Event> = HashMap::new();
    for event in events {
        let prev = event.prev();
        match by_prev.get(&prev) {
            Some(existing) if existing.id == event.id => {}
            Some(existing) => {
                return Err(StreamError::Fork {
                    prev,
                    first: existing.id.clone(),
                    second: event.id,
                });
            }
            None => {
                by_prev.insert(prev, event);
            }
        }
    }

    let mut chain = Vec::new();
    let mut cursor = from.to_string();
    let mut visited = HashSet::new();
    // Bounding the walk by the candidate count defends against crafted
    // reference cycles (e.g. prev == own id).
    for _ in 0..by_prev.len() {
        let Some(event) = by_prev.get(&cursor) else {
            break;
        };
        if !visited.insert(event.id.clone()) {
            break;
        }
        cursor = event.id.clone();
        chain.push(event.clone());
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chained_event(id: &str, prev: &str) -> Event {
        let mut event = Event::new_text_note(
            "owner".to_string(),
            prev.to_string(),
            format!("content {}", id),
            1700000000,
        );
        event.id = id.to_string();
        event
    }

    #[test]
    fn test_head_of_empty_stream_is_genesis() {
        let stream = EventStream::new("test".to_string(), "owner".to_string(), None);
        assert_eq!(stream.head(), GENESIS);
    }

    #[test]
    fn test_head_walks_the_chain() {
        let mut stream = EventStream::new("test".to_string(), "owner".to_string(), None);
        stream.log = vec![
            chained_event("e0", GENESIS),
            chained_event("e1", "e0"),
            chained_event("e2", "e1"),
        ];
        assert_eq!(stream.head(), "e2");
    }

    #[test]
    fn test_head_survives_reference_cycle() {
        let mut stream = EventStream::new("test".to_string(), "owner".to_string(), None);
        stream.log = vec![chained_event("e0", GENESIS), chained_event("e1", "e1")];
        assert_eq!(stream.head(), "e0");
    }

    #[test]
    fn test_linearize_orders_a_shuffled_chain() {
        let shuffled = vec![
            chained_event("e2", "e1"),
            chained_event("e4", "e3"),
            chained_event("e0", GENESIS),
            chained_event("e3", "e2"),
            chained_event("e1", "e0"),
        ];
        let chain = linearize(shuffled, GENESIS).unwrap();
        let ids: Vec<_> = chain.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn test_linearize_returns_suffix_from_cursor() {
        let events = vec![
            chained_event("e0", GENESIS),
            chained_event("e1", "e0"),
            chained_event("e2", "e1"),
        ];
        let chain = linearize(events, "e0").unwrap();
        let ids: Vec<_> = chain.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_linearize_detects_fork() {
        let events = vec![
            chained_event("e0", GENESIS),
            chained_event("e1", "e0"),
            chained_event("e1-evil", "e0"),
        ];
        match linearize(events, GENESIS) {
            Err(StreamError::Fork { prev, .. }) => assert_eq!(prev, "e0"),
            other => panic!("expected fork, got {:?}", other),
        }
    }

    #[test]
    fn test_linearize_collapses_duplicate_ids() {
        let events = vec![
            chained_event("e0", GENESIS),
            chained_event("e0", GENESIS),
            chained_event("e1", "e0"),
        ];
        let chain = linearize(events, GENESIS).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_linearize_is_bounded_on_self_reference() {
        let events = vec![chained_event("loop", "loop")];
        let chain = linearize(events, "loop").unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_relay_set_management() {
        let mut stream = EventStream::new("test".to_string(), "owner".to_string(), None);
        stream.add_relay("wss://relay.one").unwrap();
        assert!(matches!(
            stream.add_relay("wss://relay.one"),
            Err(StreamError::AlreadyAdded(_))
        ));
        assert!(matches!(
            stream.remove_relay("wss://relay.two"),
            Err(StreamError::NotFound(_))
        ));
        stream.remove_relay("wss://relay.one").unwrap();
        assert!(!stream.has_relays());
    }
}
