//! Stream Store
//!
//! JSON-file persistence of streams keyed by pubkey, plus the single
//! active-stream pointer. Saves go through a temp-file rename so a reader
//! after a successful save always sees the new state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::crypto::keys::{generate_keypair, pubkey_for_privkey};
use crate::error::{Result, StreamError};
use crate::ots::Timestamper;
use crate::relay::RelayPool;
use crate::stream::EventStream;

const STATE_FILE: &str = "state.json";
const STREAMS_DIR: &str = "streams";

/// Which stream is active. Empty means none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    active: String,
}

/// Store of local streams under one data directory.
pub struct StreamStore {
    base_dir: PathBuf,
    state: State,
}

impl StreamStore {
    /// Open (and if needed initialize) the store under `base_dir`.
    pub fn open(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join(STREAMS_DIR))?;
        let state_path = base_dir.join(STATE_FILE);
        let state = if state_path.exists() {
            serde_json::from_str(&fs::read_to_string(&state_path)?)?
        } else {
            let state = State::default();
            write_json_atomic(&state_path, &state)?;
            state
        };
        Ok(Self { base_dir, state })
    }

    fn stream_path(&self, pubkey: &str) -> PathBuf {
        self.base_dir
            .join(STREAMS_DIR)
            .join(format!("{}.json", pubkey))
    }

    fn save_state(&self) -> Result<()> {
        write_json_atomic(&self.base_dir.join(STATE_FILE), &self.state)
    }

    /// Create a new owned stream from a supplied private key, or generate a
    /// fresh keypair when none is given. Returns the stream; the private
    /// key is only ever stored inside it.
    pub fn create(&self, name: &str, privkey: Option<String>) -> Result<EventStream> {
        let (privkey, pubkey) = match privkey {
            Some(key) => {
                let pubkey = pubkey_for_privkey(&key)?;
                (key, pubkey)
            }
            None => generate_keypair(),
        };
        let stream = EventStream::new(name.to_string(), pubkey, Some(privkey));
        self.save(&stream)?;
        info!("created stream {} ({})", stream.name, stream.pubkey);
        Ok(stream)
    }

    /// Persist a stream. Atomic with respect to subsequent `get`.
    pub fn save(&self, stream: &EventStream) -> Result<()> {
        write_json_atomic(&self.stream_path(&stream.pubkey), stream)
    }

    /// Load the stream owned by `pubkey`.
    pub fn get(&self, pubkey: &str) -> Result<EventStream> {
        let path = self.stream_path(pubkey);
        if !path.exists() {
            return Err(StreamError::NameNotFound(pubkey.to_string()));
        }
        let stream = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(stream)
    }

    /// Load a stream by its local label.
    pub fn get_by_name(&self, name: &str) -> Result<EventStream> {
        let pubkey = self.pubkey_for_name(name)?;
        self.get(&pubkey)
    }

    /// Resolve a local label to a pubkey. Two streams sharing a label make
    /// the lookup ambiguous.
    pub fn pubkey_for_name(&self, name: &str) -> Result<String> {
        let mut found: Option<String> = None;
        for stream in self.list_all()? {
            if stream.name == name {
                if let Some(first) = found {
                    return Err(StreamError::AmbiguousName {
                        name: name.to_string(),
                        first,
                        second: stream.pubkey,
                    });
                }
                found = Some(stream.pubkey);
            }
        }
        found.ok_or_else(|| StreamError::NameNotFound(name.to_string()))
    }

    /// All locally stored streams.
    pub fn list_all(&self) -> Result<Vec<EventStream>> {
        let mut streams = Vec::new();
        for entry in fs::read_dir(self.base_dir.join(STREAMS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let stream: EventStream = serde_json::from_str(&fs::read_to_string(&path)?)?;
            streams.push(stream);
        }
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(streams)
    }

    /// Owned streams only (a private key is present).
    pub fn list_owned(&self) -> Result<Vec<EventStream>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(EventStream::is_owned)
            .collect())
    }

    /// Remove a stream's file. Clears the active pointer when the removed
    /// stream was active.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let pubkey = self.pubkey_for_name(name)?;
        if self.state.active == pubkey {
            self.state.active.clear();
            self.save_state()?;
        }
        fs::remove_file(self.stream_path(&pubkey))?;
        info!("removed stream {} ({})", name, pubkey);
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let pubkey = self.pubkey_for_name(name)?;
        self.state.active = pubkey;
        self.save_state()
    }

    pub fn active_pubkey(&self) -> Option<&str> {
        if self.state.active.is_empty() {
            None
        } else {
            Some(&self.state.active)
        }
    }

    /// Load the active stream.
    pub fn get_active(&self) -> Result<EventStream> {
        let pubkey = self.active_pubkey().ok_or(StreamError::NoActiveStream)?;
        self.get(pubkey)
    }

    /// Follow a remote stream: store it keyed by `pubkey` with no private
    /// key, then sync its history from the pool. The synced prefix is
    /// persisted even when the sync fails partway.
    pub async fn follow(
        &self,
        pool: &RelayPool,
        ts: &dyn Timestamper,
        pubkey: &str,
        name: &str,
    ) -> Result<EventStream> {
        if pubkey.is_empty() {
            return Err(StreamError::InvalidInput(
                "follow pubkey is empty".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(StreamError::InvalidInput(
                "stream name can't be empty".to_string(),
            ));
        }

        let mut stream = EventStream::new(name.to_string(), pubkey.to_string(), None);
        self.save(&stream)?;
        debug!("following {} as {}", pubkey, name);

        let outcome = stream.sync(pool, ts).await;
        self.save(&stream)?;
        outcome?;
        Ok(stream)
    }

    /// Unfollow is removal.
    pub fn unfollow(&mut self, name: &str) -> Result<()> {
        self.remove(name)
    }
}

/// Write a JSON value through a sibling temp file and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = StreamStore::open(dir.path().to_path_buf()).unwrap();

        let stream = store.create("alice", None).unwrap();
        let loaded = store.get(&stream.pubkey).unwrap();
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.pubkey, stream.pubkey);
        assert!(loaded.is_owned());
    }

    #[test]
    fn test_active_stream_lifecycle() {
        let dir = tempdir().unwrap();
        let mut store = StreamStore::open(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            store.get_active(),
            Err(StreamError::NoActiveStream)
        ));

        store.create("alice", None).unwrap();
        store.set_active("alice").unwrap();
        assert_eq!(store.get_active().unwrap().name, "alice");

        // Removing the active stream clears the pointer.
        store.remove("alice").unwrap();
        assert!(matches!(
            store.get_active(),
            Err(StreamError::NoActiveStream)
        ));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = StreamStore::open(dir.path().to_path_buf()).unwrap();
            store.create("alice", None).unwrap();
            store.set_active("alice").unwrap();
        }
        let store = StreamStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.get_active().unwrap().name, "alice");
    }

    #[test]
    fn test_ambiguous_name_fails_lookup() {
        let dir = tempdir().unwrap();
        let store = StreamStore::open(dir.path().to_path_buf()).unwrap();
        store.create("dup", None).unwrap();
        store.create("dup", None).unwrap();
        assert!(matches!(
            store.pubkey_for_name("dup"),
            Err(StreamError::AmbiguousName { .. })
        ));
    }

    #[test]
    fn test_unknown_name_fails_lookup() {
        let dir = tempdir().unwrap();
        let store = StreamStore::open(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            store.pubkey_for_name("ghost"),
            Err(StreamError::NameNotFound(_))
        ));
    }

    #[test]
    fn test_list_owned_excludes_followed() {
        let dir = tempdir().unwrap();
        let store = StreamStore::open(dir.path().to_path_buf()).unwrap();
        store.create("mine", None).unwrap();
        let followed = EventStream::new("theirs".to_string(), "ab".repeat(32), None);
        store.save(&followed).unwrap();

        assert_eq!(store.list_all().unwrap().len(), 2);
        let owned = store.list_owned().unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "mine");
    }
}
