//! World Loop
//!
//! Bulk-sync every followed stream to its remote head, then keep listening:
//! one subscription over the union of followed pubkeys, deduplicated by
//! event id at the sink, torn down on SIGINT/SIGTERM.

use std::collections::HashSet;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::Event;
use crate::ots::Timestamper;
use crate::relay::{Filter, RelayPool};
use crate::store::StreamStore;

/// Run the world loop until interrupted.
pub async fn run(store: &StreamStore, pool: &mut RelayPool, ts: &dyn Timestamper) -> Result<()> {
    let all = store.list_all()?;
    if all.is_empty() {
        warn!("you need to be following at least one stream to run world");
        return Ok(());
    }

    // Only streams with a non-empty relay list can be fetched.
    let mut streams: Vec<_> = all.into_iter().filter(|es| es.has_relays()).collect();
    if streams.is_empty() {
        warn!("no followed stream has any relays configured");
        return Ok(());
    }

    for stream in &streams {
        for url in stream.list_relays() {
            if let Err(e) = pool.add(url).await {
                warn!("skipping relay {}: {}", url, e);
            }
        }
    }

    info!("syncing {} event streams, this may take a while...", streams.len());
    for stream in &mut streams {
        let outcome = stream.sync(pool, ts).await;
        // Persist whatever was appended before surfacing sync trouble.
        store.save(stream)?;
        match outcome {
            Ok(appended) => info!("synced {} (+{} events)", stream.name, appended),
            Err(e) => warn!("sync of {} stopped: {}", stream.name, e),
        }
    }

    let authors: Vec<String> = streams.iter().map(|es| es.pubkey.clone()).collect();
    let filter = Filter::new().authors(authors);

    let (sink, mut incoming) = mpsc::channel::<Event>(64);
    let cancel = CancellationToken::new();
    let listeners = pool.listen(&filter, sink, cancel.clone()).await?;
    info!("listening for new events on {} relays", pool.len());

    let mut sigterm = signal(SignalKind::terminate())?;
    // Relays overlap, so the same event arrives more than once.
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down listeners");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated, shutting down listeners");
                break;
            }
            received = incoming.recv() => {
                match received {
                    Some(event) => {
                        if !seen.insert(event.id.clone()) {
                            continue;
                        }
                        handle_event(store, ts, event).await;
                    }
                    None => break,
                }
            }
        }
    }

    cancel.cancel();
    for listener in listeners {
        let _ = listener.await;
    }
    Ok(())
}

/// Append a live event to its stream when it extends the head; anything
/// else is ignorable noise, not a failure.
async fn handle_event(store: &StreamStore, ts: &dyn Timestamper, event: Event) {
    let mut stream = match store.get(&event.pubkey) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("dropping event {} from unknown author: {}", event.id, e);
            return;
        }
    };

    let expected = stream.head();
    let prev = event.prev();
    if prev != expected {
        debug!(
            "ignoring event {} from {}: expected prev {}, got {}",
            event.id, stream.name, expected, prev
        );
        return;
    }

    println!("{}", event.display(Some(&stream.name), true));

    match stream.append(event, ts).await {
        Ok(()) => {
            if let Err(e) = store.save(&stream) {
                warn!("could not persist {}: {}", stream.name, e);
            }
        }
        Err(e) => warn!("rejected live event on {}: {}", stream.name, e),
    }
}
