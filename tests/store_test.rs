//! Store round-trip tests: a saved stream reloads with identical ids, head
//! and attestations.

mod common;

use common::{author, signed_chain, MockTimestamper};
use es_app::error::StreamError;
use es_app::store::StreamStore;
use es_app::stream::EventStream;
use tempfile::tempdir;

#[tokio::test]
async fn test_save_load_preserves_head_and_ids() {
    let dir = tempdir().unwrap();
    let store = StreamStore::open(dir.path().to_path_buf()).unwrap();

    let author = author();
    let mut stream = EventStream::new(
        "alice".to_string(),
        author.pubkey.clone(),
        Some(author.privkey.clone()),
    );
    let ts = MockTimestamper::pending();
    for content in ["one", "two", "three"] {
        stream.create(content, &ts).await.unwrap();
    }
    stream.add_relay("wss://relay.example").unwrap();
    store.save(&stream).unwrap();

    let loaded = store.get(&stream.pubkey).unwrap();
    assert_eq!(loaded.head(), stream.head());
    assert_eq!(loaded.size(), 3);
    for (saved, original) in loaded.log.iter().zip(stream.log.iter()) {
        assert_eq!(saved.id, original.id);
        assert_eq!(saved.sig, original.sig);
        assert_eq!(saved.ots, original.ots);
        assert_eq!(saved.prev(), original.prev());
        saved.verify().unwrap();
    }
    assert_eq!(loaded.list_relays(), stream.list_relays());
}

#[tokio::test]
async fn test_save_is_atomic_for_subsequent_get() {
    let dir = tempdir().unwrap();
    let store = StreamStore::open(dir.path().to_path_buf()).unwrap();

    let author = author();
    let mut stream = EventStream::new(
        "alice".to_string(),
        author.pubkey.clone(),
        Some(author.privkey.clone()),
    );
    let ts = MockTimestamper::pending();
    store.save(&stream).unwrap();

    for round in 0..5 {
        stream.create(&format!("round {}", round), &ts).await.unwrap();
        store.save(&stream).unwrap();
        let loaded = store.get(&stream.pubkey).unwrap();
        assert_eq!(loaded.size(), round + 1);
        assert_eq!(loaded.head(), stream.head());
    }
}

#[test]
fn test_followed_chain_survives_reload() {
    let dir = tempdir().unwrap();
    let store = StreamStore::open(dir.path().to_path_buf()).unwrap();

    let author = author();
    let mut followed = EventStream::new("bob".to_string(), author.pubkey.clone(), None);
    followed.log = signed_chain(&author, 4);
    store.save(&followed).unwrap();

    let loaded = store.get(&author.pubkey).unwrap();
    assert!(!loaded.is_owned());
    assert_eq!(loaded.head(), followed.log.last().unwrap().id);
}

#[test]
fn test_remove_deletes_stream_file() {
    let dir = tempdir().unwrap();
    let mut store = StreamStore::open(dir.path().to_path_buf()).unwrap();
    let stream = store.create("alice", None).unwrap();

    store.remove("alice").unwrap();
    assert!(matches!(
        store.get(&stream.pubkey),
        Err(StreamError::NameNotFound(_))
    ));
    assert!(store.list_all().unwrap().is_empty());
}
