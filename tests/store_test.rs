//! CubeStore acceptance pipeline, contest resolution and retention.

use cubenet::crypto::Keypair;
use cubenet::cube::{Cube, CubeMeta};
use cubenet::field::Field;
use cubenet::store::{cube_contest, CubeStore, RetentionPolicy};
use cubenet::types::{now_timestamp, CUBE_SIZE};
use std::cmp::Ordering;

async fn frozen_bytes(payload: &[u8]) -> Vec<u8> {
    let mut cube = Cube::sculpt_frozen(vec![Field::payload(payload.to_vec())], 0).unwrap();
    cube.binary().await.unwrap().to_vec()
}

async fn muc_bytes(seed: u8, payload: &[u8], date: u64) -> Vec<u8> {
    let mut cube = Cube::sculpt_muc(
        Keypair::from_seed(&[seed; 32]),
        vec![Field::payload(payload.to_vec())],
        0,
    )
    .unwrap();
    cube.set_date(date).unwrap();
    cube.binary().await.unwrap().to_vec()
}

async fn meta_of(bytes: &[u8]) -> CubeMeta {
    Cube::from_binary(bytes).unwrap().meta().await.unwrap()
}

#[tokio::test]
async fn add_then_get_has_info() {
    let store = CubeStore::open_temporary(0, None).unwrap();
    let bytes = frozen_bytes(b"stored").await;

    let meta = store.add_cube(&bytes).await.unwrap().expect("stored");
    assert!(store.has_cube(&meta.key).unwrap());
    assert_eq!(store.get_binary(&meta.key).unwrap().unwrap(), bytes);

    let info = store.get_cube_info(&meta.key).await.unwrap().unwrap();
    assert_eq!(info, meta);

    let keys = store.all_keys().unwrap();
    assert_eq!(keys, vec![meta.key]);
    assert_eq!(store.all_meta().await.unwrap(), vec![meta]);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn duplicates_are_discarded() {
    let store = CubeStore::open_temporary(0, None).unwrap();
    let bytes = frozen_bytes(b"once").await;

    assert!(store.add_cube(&bytes).await.unwrap().is_some());
    assert!(store.add_cube(&bytes).await.unwrap().is_none());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn invalid_input_is_silently_dropped() {
    let store = CubeStore::open_temporary(0, None).unwrap();

    // Wrong size.
    assert!(store.add_cube(&[0u8; 12]).await.unwrap().is_none());
    // Right size, garbage layout.
    assert!(store.add_cube(&[0x55u8; CUBE_SIZE]).await.unwrap().is_none());
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn insufficient_difficulty_is_rejected() {
    // A cube mined at difficulty 0 will not meet 20 trailing zero bits
    // by chance.
    let store = CubeStore::open_temporary(20, None).unwrap();
    let bytes = frozen_bytes(b"weak proof").await;
    assert!(store.add_cube(&bytes).await.unwrap().is_none());
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn muc_update_replaces_older() {
    let store = CubeStore::open_temporary(0, None).unwrap();
    let t = now_timestamp();
    let v1 = muc_bytes(1, b"first", t).await;
    let v2 = muc_bytes(1, b"second", t + 1).await;
    let key = meta_of(&v1).await.key;
    assert_eq!(meta_of(&v2).await.key, key);

    assert!(store.add_cube(&v1).await.unwrap().is_some());
    assert!(store.add_cube(&v2).await.unwrap().is_some());
    assert_eq!(store.len(), 1);
    assert_eq!(store.get_binary(&key).unwrap().unwrap(), v2);

    // The stale version loses the contest on arrival.
    assert!(store.add_cube(&v1).await.unwrap().is_none());
    assert_eq!(store.get_binary(&key).unwrap().unwrap(), v2);
}

/// Whatever the insertion order, the store converges on the contest
/// winner.
#[tokio::test]
async fn contest_winner_is_order_independent() {
    let t = now_timestamp();
    let a = muc_bytes(2, b"candidate a", t).await;
    let b = muc_bytes(2, b"candidate b", t).await;

    let meta_a = meta_of(&a).await;
    let meta_b = meta_of(&b).await;
    let winner = match cube_contest(&meta_a, &meta_b) {
        Ordering::Greater => &a,
        Ordering::Less => &b,
        Ordering::Equal => panic!("distinct cubes cannot tie"),
    };

    for order in [[&a, &b], [&b, &a]] {
        let store = CubeStore::open_temporary(0, None).unwrap();
        for bytes in order {
            store.add_cube(bytes).await.unwrap();
        }
        assert_eq!(store.len(), 1);
        assert_eq!(&store.get_binary(&meta_a.key).unwrap().unwrap(), winner);
    }
}

/// Cubes dated outside the retention window never enter the store.
#[tokio::test]
async fn retention_window_rejects_out_of_range_dates() {
    let half_year = 183 * 24 * 60 * 60;
    let year = 2 * half_year;
    let store = CubeStore::open_temporary(
        0,
        Some(RetentionPolicy {
            past_secs: half_year,
            future_secs: half_year,
        }),
    )
    .unwrap();

    let t = now_timestamp();
    let too_old = muc_bytes(3, b"ancient", t.saturating_sub(year)).await;
    let too_new = muc_bytes(4, b"from the future", t + year).await;

    for bytes in [&too_old, &too_new] {
        let key = meta_of(bytes).await.key;
        assert!(store.add_cube(bytes).await.unwrap().is_none());
        assert!(!store.has_cube(&key).unwrap());
    }
    assert_eq!(store.len(), 0);

    // A record dated now is inside the window.
    let current = muc_bytes(5, b"fresh", t).await;
    assert!(store.add_cube(&current).await.unwrap().is_some());
}

#[tokio::test]
async fn cube_added_events_fire_on_store_and_replace() {
    let store = CubeStore::open_temporary(0, None).unwrap();
    let mut events = store.subscribe();

    let t = now_timestamp();
    let v1 = muc_bytes(6, b"v1", t).await;
    let v2 = muc_bytes(6, b"v2", t + 1).await;

    store.add_cube(&v1).await.unwrap();
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, meta_of(&v1).await);

    // Losing candidates emit nothing; winners emit again.
    store.add_cube(&v1).await.unwrap();
    store.add_cube(&v2).await.unwrap();
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, meta_of(&v2).await);
}
