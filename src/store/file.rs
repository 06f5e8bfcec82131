use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, StoreError};

use super::{EmbeddedStore, StoreTxn};

const RECORD_EXT: &str = "json";

/// Embedded store keeping one file per record in a directory.
///
/// File names are the hex-encoded record ids. Every write goes to a temp file
/// in the same directory which is then renamed over the record, so readers
/// see either the old or the new version.
pub struct FileStore {
    dir: PathBuf,
    commit_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            commit_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", hex::encode(id.as_bytes())))
    }

    fn write_record(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.record_path(id))
            .map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

impl EmbeddedStore for FileStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.record_path(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(raw) = hex::decode(stem) {
                if let Ok(id) = String::from_utf8(raw) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn commit(&self, txn: StoreTxn) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let writes = txn.into_writes();
        let count = writes.len();
        for (id, write) in writes {
            match write {
                Some(bytes) => self.write_record(&id, &bytes)?,
                None => match fs::remove_file(self.record_path(&id)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                },
            }
        }
        debug!(dir = %self.dir.display(), writes = count, "file store commit");
        Ok(())
    }
}
