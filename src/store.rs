//! Content-addressed cube store on sled.
//!
//! The backing layout is a flat key-value map: 32-byte cube key to
//! 1024-byte cube binary. No secondary indexes are persisted; metadata
//! (date, challenge level, type) is recomputed by decompiling the record.
//!
//! `add_cube` runs the full acceptance pipeline and silently discards
//! invalid input: one misbehaving peer must not abort local service.
//! Concurrent writers are serialized so the "exactly one cube per key"
//! invariant holds; readers see either the pre-contest or post-contest
//! record, never a partial state.

use crate::cube::{Cube, CubeError, CubeMeta};
use crate::types::{now, CubeKey, CUBE_KEY_SIZE, CUBE_SIZE};
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

/// Capacity of the `cube_added` broadcast channel. Slow subscribers lag
/// and drop rather than buffering without bound.
const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("db open")]
    DbOpen,
    #[error("db io")]
    DbIo,
}

/// Optional acceptance window around the current time. Cubes dated outside
/// `[now - past, now + future]` are rejected.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub past_secs: u64,
    pub future_secs: u64,
}

impl RetentionPolicy {
    fn admits(&self, date: u64, now: u64) -> bool {
        date >= now.saturating_sub(self.past_secs) && date <= now.saturating_add(self.future_secs)
    }
}

/// Total order over two valid MUC candidates for the same key. `Greater`
/// means `a` wins the contest.
///
/// 1. Newer date wins.
/// 2. Tie: higher challenge level wins.
/// 3. Tie: lexicographically larger binary hash wins.
///
/// Deterministic, so every honest peer converges on the same winner.
pub fn cube_contest(a: &CubeMeta, b: &CubeMeta) -> Ordering {
    a.date
        .cmp(&b.date)
        .then(a.challenge_level.cmp(&b.challenge_level))
        .then(a.hash.cmp(&b.hash))
}

/// Deduplicated content-addressed store shared by all connections.
pub struct CubeStore {
    db: sled::Db,
    /// Serializes the read-contest-write section of `add_cube`.
    write_lock: Mutex<()>,
    events: broadcast::Sender<CubeMeta>,
    required_difficulty: u8,
    retention: Option<RetentionPolicy>,
}

impl CubeStore {
    /// Open (or create) a store at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        required_difficulty: u8,
        retention: Option<RetentionPolicy>,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|_| StoreError::DbOpen)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            events,
            required_difficulty,
            retention,
        })
    }

    /// In-memory store for tests.
    pub fn open_temporary(
        required_difficulty: u8,
        retention: Option<RetentionPolicy>,
    ) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|_| StoreError::DbOpen)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            events,
            required_difficulty,
            retention,
        })
    }

    /// Receive `cube_added` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CubeMeta> {
        self.events.subscribe()
    }

    pub fn required_difficulty(&self) -> u8 {
        self.required_difficulty
    }

    /// Validate an incoming binary in isolation and produce its metadata.
    async fn validate(&self, bytes: &[u8]) -> Result<CubeMeta, CubeError> {
        let mut cube = Cube::from_binary(bytes)?;
        cube.verify(self.required_difficulty)?;
        cube.meta().await
    }

    /// Run the acceptance pipeline on an incoming binary.
    ///
    /// Returns `Ok(Some(meta))` when the record was stored (first sighting
    /// or contest win), `Ok(None)` when it was rejected or discarded as a
    /// duplicate/loser. Validation failures are logged, never propagated.
    pub async fn add_cube(&self, bytes: &[u8]) -> Result<Option<CubeMeta>, StoreError> {
        let meta = match self.validate(bytes).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("discarding invalid cube: {}", e);
                return Ok(None);
            }
        };

        if let Some(policy) = &self.retention
            && !policy.admits(meta.date, now())
        {
            debug!(
                "discarding cube {} dated outside retention window ({})",
                hex::encode(meta.key),
                meta.date
            );
            return Ok(None);
        }

        let _guard = self.write_lock.lock().await;

        match self.db.get(meta.key).map_err(|_| StoreError::DbIo)? {
            None => {}
            Some(existing) => {
                if !meta.cube_type.is_mutable() {
                    // Same key, same content: nothing to do.
                    trace!("duplicate frozen cube {}", hex::encode(meta.key));
                    return Ok(None);
                }
                // MUC contest against the incumbent.
                match self.meta_of(&existing).await {
                    Ok(stored) => {
                        if cube_contest(&meta, &stored) != Ordering::Greater {
                            trace!("muc {} lost contest", hex::encode(meta.key));
                            return Ok(None);
                        }
                        debug!(
                            "muc {} replaced by newer version (date {} -> {})",
                            hex::encode(meta.key),
                            stored.date,
                            meta.date
                        );
                    }
                    // An undecodable incumbent is always replaced.
                    Err(e) => debug!("stored cube unreadable, replacing: {}", e),
                }
            }
        }

        self.db
            .insert(meta.key, bytes)
            .map_err(|_| StoreError::DbIo)?;
        let _ = self.events.send(meta.clone());
        Ok(Some(meta))
    }

    async fn meta_of(&self, bytes: &[u8]) -> Result<CubeMeta, CubeError> {
        Cube::from_binary(bytes)?.meta().await
    }

    /// Fetch and parse a stored cube.
    pub fn get_cube(&self, key: &CubeKey) -> Result<Option<Cube>, StoreError> {
        match self.db.get(key).map_err(|_| StoreError::DbIo)? {
            None => Ok(None),
            Some(bytes) => Ok(Cube::from_binary(&bytes).ok()),
        }
    }

    /// Fetch a stored cube binary.
    pub fn get_binary(&self, key: &CubeKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .db
            .get(key)
            .map_err(|_| StoreError::DbIo)?
            .map(|v| v.to_vec()))
    }

    pub fn has_cube(&self, key: &CubeKey) -> Result<bool, StoreError> {
        self.db.contains_key(key).map_err(|_| StoreError::DbIo)
    }

    /// Metadata of a stored cube, recomputed from its binary.
    pub async fn get_cube_info(&self, key: &CubeKey) -> Result<Option<CubeMeta>, StoreError> {
        match self.db.get(key).map_err(|_| StoreError::DbIo)? {
            None => Ok(None),
            Some(bytes) => Ok(self.meta_of(&bytes).await.ok()),
        }
    }

    /// All stored keys.
    pub fn all_keys(&self) -> Result<Vec<CubeKey>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (k, _) = item.map_err(|_| StoreError::DbIo)?;
            if k.len() == CUBE_KEY_SIZE {
                let mut key = [0u8; CUBE_KEY_SIZE];
                key.copy_from_slice(&k);
                out.push(key);
            }
        }
        Ok(out)
    }

    /// Metadata of every stored cube. Records that fail to decompile are
    /// skipped.
    pub async fn all_meta(&self) -> Result<Vec<CubeMeta>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (_, v) = item.map_err(|_| StoreError::DbIo)?;
            if v.len() == CUBE_SIZE
                && let Ok(meta) = self.meta_of(&v).await
            {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// Number of stored cubes.
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}
