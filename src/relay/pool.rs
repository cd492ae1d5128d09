//! Relay Pool
//!
//! Fan-out across every configured relay: parallel queries deduplicated by
//! event id, publishes that succeed when at least one relay accepts, and a
//! unified subscription with a shared cancellation signal.

use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::relay::connection::Relay;
use crate::relay::filter::Filter;

/// A pool of live relay endpoints keyed by URL.
#[derive(Debug, Default)]
pub struct RelayPool {
    relays: HashMap<String, Relay>,
}

impl RelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial and insert a relay. Adding a member twice is a no-op.
    pub async fn add(&mut self, url: &str) -> Result<()> {
        if self.relays.contains_key(url) {
            debug!("relay {} already in the pool", url);
            return Ok(());
        }
        let parsed = url::Url::parse(url).map_err(|e| StreamError::RelayDialFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(StreamError::RelayDialFailed {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let relay = Relay::dial(url).await?;
        info!("connected to relay {}", url);
        self.relays.insert(url.to_string(), relay);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.keys().cloned().collect()
    }

    /// Query a single pool member.
    pub async fn single_query(&self, url: &str, filter: &Filter) -> Result<Vec<Event>> {
        let relay = self
            .relays
            .get(url)
            .ok_or_else(|| StreamError::NotFound(url.to_string()))?;
        relay.query(filter).await
    }

    /// Fan the query out to every pool member in parallel, await all, and
    /// union the results by event id (first occurrence wins).
    pub async fn query_pool(&self, filter: &Filter) -> Result<Vec<Event>> {
        if self.relays.is_empty() {
            return Err(StreamError::EmptyPool);
        }

        let queries = self
            .relays
            .values()
            .map(|relay| {
                let relay = relay.clone();
                let filter = filter.clone();
                async move { (relay.url.clone(), relay.query(&filter).await) }
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for (url, result) in join_all(queries).await {
            match result {
                Ok(batch) => {
                    for event in batch {
                        if seen.insert(event.id.clone()) {
                            events.push(event);
                        }
                    }
                }
                Err(e) => warn!("query against {} failed: {}", url, e),
            }
        }
        Ok(events)
    }

    /// Subscribe on every pool member, forwarding events into `sink` until
    /// `cancel` fires. Returns the listener tasks so callers can join them
    /// after cancellation.
    pub async fn listen(
        &self,
        filter: &Filter,
        sink: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        if self.relays.is_empty() {
            return Err(StreamError::EmptyPool);
        }

        let mut handles = Vec::new();
        for relay in self.relays.values() {
            let relay = relay.clone();
            let filter = filter.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = relay.subscribe(&filter, sink, cancel).await {
                    warn!("listener for {} exited: {}", relay.url, e);
                }
            }));
        }
        Ok(handles)
    }

    /// Publish an event to each listed relay. Per-relay failures are logged;
    /// the publish fails only when no relay accepts the event.
    pub async fn broadcast(&self, urls: &[String], event: &Event) -> Result<()> {
        if urls.is_empty() {
            return Err(StreamError::EmptyPool);
        }

        let mut accepted = 0;
        let mut failures = Vec::new();
        for url in urls {
            match self.send(url, event).await {
                Ok(()) => {
                    info!("sent event {} to {}", event.id, url);
                    accepted += 1;
                }
                Err(e) => {
                    warn!("failed to send event {} to {}: {}", event.id, url, e);
                    failures.push(format!("{}: {}", url, e));
                }
            }
        }

        if accepted == 0 {
            return Err(StreamError::PublishFailed(failures.join("; ")));
        }
        Ok(())
    }

    /// Publish an event to a single relay, pool member or not.
    pub async fn send(&self, url: &str, event: &Event) -> Result<()> {
        let relay = match self.relays.get(url) {
            Some(relay) => relay.clone(),
            None => Relay {
                url: url.to_string(),
            },
        };
        relay.publish(event).await
    }
}
