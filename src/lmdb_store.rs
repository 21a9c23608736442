//! LMDB-backed [`LocalStore`].
//!
//! The environment lives in a `<name>.lmdb` directory next to the host app's
//! data. LMDB's map size acts as the device quota: a write that does not fit
//! surfaces as [`StoreError::QuotaExceeded`] and the transaction is aborted,
//! so the previous value stays intact.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use lmdb_sys::{MDB_FIRST, MDB_NEXT, MDB_SET_RANGE};
use log::{debug, info, warn};

use crate::local_store::{LocalStore, StoreError};

const DB_NAME: &str = "offline_sync";

/// Key the cursor landed on, `None` past the last entry.
fn step<'txn>(
    result: lmdb::Result<(Option<&'txn [u8]>, &'txn [u8])>,
) -> Result<Option<&'txn [u8]>, StoreError> {
    match result {
        Ok((key, _)) => Ok(key),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl From<lmdb::Error> for StoreError {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::MapFull => StoreError::QuotaExceeded,
            other => StoreError::Backend(format!("LMDB error: {other}")),
        }
    }
}

pub struct LmdbStore {
    env: Environment,
    db: Database,
    path: PathBuf,
}

impl LmdbStore {
    /// Opens (creating if needed) the environment at `<name>.lmdb`.
    pub fn open(name: impl AsRef<Path>, map_size_bytes: usize) -> Result<Self, StoreError> {
        let mut dir = OsString::from(name.as_ref().as_os_str());
        dir.push(".lmdb");
        let path = PathBuf::from(dir);

        if path.exists() {
            info!("Opening existing LMDB store at {}", path.display());
        } else {
            info!("Creating LMDB store at {}", path.display());
        }

        std::fs::create_dir_all(&path).map_err(|e| {
            warn!("Could not create {}: {e}", path.display());
            StoreError::Backend(format!("cannot create {}: {e}", path.display()))
        })?;

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(map_size_bytes)
            .open(&path)?;
        let db = env.create_db(Some(DB_NAME), DatabaseFlags::empty())?;

        Ok(Self { env, db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalStore for LmdbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.env.begin_ro_txn()?;
        let value = match txn.get(self.db, &key) {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        txn.commit()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.db, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        debug!("LMDB wrote {} bytes to {key}", value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.db, &key, None) {
            Ok(()) => {
                txn.commit()?;
                Ok(true)
            }
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let txn = self.env.begin_ro_txn()?;
        let mut keys = Vec::new();
        {
            let cursor = txn.open_ro_cursor(self.db)?;
            // LMDB rejects zero-length keys, so an empty prefix starts at the first entry.
            let mut entry = if prefix.is_empty() {
                step(cursor.get(None, None, MDB_FIRST))?
            } else {
                step(cursor.get(Some(prefix.as_bytes()), None, MDB_SET_RANGE))?
            };
            while let Some(key) = entry {
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                match std::str::from_utf8(key) {
                    Ok(k) => keys.push(k.to_string()),
                    Err(e) => warn!("Skipping non UTF-8 key under {prefix}: {e}"),
                }
                entry = step(cursor.get(None, None, MDB_NEXT))?;
            }
        }
        txn.commit()?;
        Ok(keys)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.db)?;
        txn.commit()?;
        info!("Cleared LMDB store at {}", self.path.display());
        Ok(())
    }
}
