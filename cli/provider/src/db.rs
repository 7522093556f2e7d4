//! Durable packing progress, backed by RocksDB with snappy compression.
//!
//! Two keyspaces share the store:
//!
//! * per-block progress records under `"<cid>/<hex(sha256(cid || SALT))>"`
//!   holding `b"0s"` (doing) or `b"1s"` (done); the salted suffix keeps the
//!   records from colliding with unrelated keys should the store ever be
//!   shared with another subsystem;
//! * the mining cursor under [`CURSOR_KEY`], a little-endian u64 naming the
//!   next sector index to prove.
//!
//! Exactly one agent process may own a store path; a second opener hits the
//! store lock and gets [`ProgressStoreError::Locked`], which callers treat as
//! "go offline" rather than a crash.

use std::path::Path;

use rocksdb::{DBCompressionType, Options, WriteBatch, DB};
use sha2::{Digest, Sha256};

/// Key of the miner's round cursor.
pub const CURSOR_KEY: &[u8] = b"v2/mining/sector/idx";

/// Progress value of a block consumed by an unpublished sector.
pub const DOING: &[u8] = b"0s";
/// Progress value of a block owned by a published sector.
pub const DONE: &[u8] = b"1s";

/// Salt mixed into every progress key.
const SALT: [u8; 32] = [
    1, 9, 0, 0, 1, 9, 9, 0, 2, 0, 0, 0, 2, 0, 1, 0, 2, 0, 1, 9, 2, 0, 2, 0, 2, 0, 2, 1, 2, 0, 2,
    2,
];

#[derive(Debug, thiserror::Error)]
pub enum ProgressStoreError {
    #[error("progress store is locked by another process")]
    Locked,

    #[error(transparent)]
    RocksDb(#[from] rocksdb::Error),
}

pub struct ProgressStore {
    database: DB,
}

impl ProgressStore {
    /// Opens (or creates) the store at `path`. Lock contention with another
    /// process is reported as [`ProgressStoreError::Locked`] so the caller
    /// can bow out gracefully.
    pub fn open(path: &Path) -> Result<Self, ProgressStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Snappy);

        match DB::open(&opts, path) {
            Ok(database) => Ok(Self { database }),
            Err(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("resource temporarily unavailable") || text.contains("lock") {
                    Err(ProgressStoreError::Locked)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn progress_key(cid: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(cid.as_bytes());
        hasher.update(SALT);
        format!("{}/{}", cid, hex::encode(hasher.finalize())).into_bytes()
    }

    pub fn progress(&self, cid: &str) -> Result<Option<Vec<u8>>, ProgressStoreError> {
        Ok(self.database.get(Self::progress_key(cid))?)
    }

    pub fn is_done(&self, cid: &str) -> Result<bool, ProgressStoreError> {
        Ok(self.progress(cid)?.as_deref() == Some(DONE))
    }

    pub fn mark_doing(&self, cid: &str) -> Result<(), ProgressStoreError> {
        Ok(self.database.put(Self::progress_key(cid), DOING)?)
    }

    pub fn mark_done(&self, cid: &str) -> Result<(), ProgressStoreError> {
        Ok(self.database.put(Self::progress_key(cid), DONE)?)
    }

    /// Builds a write batch and commits it atomically.
    pub fn transaction<F>(&self, build: F) -> Result<(), ProgressStoreError>
    where
        F: FnOnce(&mut WriteBatch),
    {
        let mut batch = WriteBatch::default();
        build(&mut batch);
        Ok(self.database.write(batch)?)
    }

    /// Flips every cid to done in a single write batch, so a crash can never
    /// leave a published sector's blocks half-committed.
    pub fn commit_done<I, S>(&self, cids: I) -> Result<(), ProgressStoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.transaction(|batch| {
            for cid in cids {
                batch.put(Self::progress_key(cid.as_ref()), DONE);
            }
        })
    }

    /// The last proven sector index, if any round completed before.
    pub fn cursor(&self) -> Result<Option<u64>, ProgressStoreError> {
        let Some(raw) = self.database.get(CURSOR_KEY)? else {
            return Ok(None);
        };
        let Ok(bytes) = <[u8; 8]>::try_from(raw.as_slice()) else {
            return Ok(None);
        };
        Ok(Some(u64::from_le_bytes(bytes)))
    }

    pub fn set_cursor(&self, index: u64) -> Result<(), ProgressStoreError> {
        Ok(self.database.put(CURSOR_KEY, index.to_le_bytes())?)
    }
}
