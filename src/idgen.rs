use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Highest id reserved for built-in records (root and user root).
pub const RESERVED_IDS: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IdRecord {
    counter: u64,
}

#[derive(Debug)]
struct IdState {
    counter: u64,
    dirty: bool,
}

/// Monotonic id counter for embedded nodes.
///
/// The counter is persisted in its own record whenever a commit finds it
/// dirty.
#[derive(Debug)]
pub struct IdGenerator {
    state: Mutex<IdState>,
}

impl IdGenerator {
    /// Counter starting after `counter`.
    pub fn new(counter: u64) -> Self {
        Self {
            state: Mutex::new(IdState {
                counter: counter.max(RESERVED_IDS),
                dirty: false,
            }),
        }
    }

    /// Restores the counter from its stored record, if any.
    pub fn from_record(bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            Some(bytes) => {
                let record: IdRecord = serde_json::from_slice(bytes)?;
                Ok(Self::new(record.counter))
            }
            None => Ok(Self::new(RESERVED_IDS)),
        }
    }

    /// Next unused id.
    pub fn next_id(&self) -> String {
        let mut state = self.state.lock();
        state.counter += 1;
        state.dirty = true;
        state.counter.to_string()
    }

    /// Last id handed out.
    pub fn current(&self) -> u64 {
        self.state.lock().counter
    }

    /// Encoded counter if it changed since the last call, clearing the flag.
    pub fn take_dirty_record(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(None);
        }
        let bytes = serde_json::to_vec(&IdRecord {
            counter: state.counter,
        })?;
        state.dirty = false;
        Ok(Some(bytes))
    }

    /// Flags the counter for rewriting after a failed commit.
    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }
}
