use std::collections::BTreeMap;

use crate::error::Result;
use crate::handle::NodeHandle;

/// Child list materialized one segment at a time.
///
/// `size` answers from a cached backend count, so large relational
/// collections can be counted and paged without loading every id. Indexes
/// are dense: removed backend entries are skipped and in-memory additions
/// follow the surviving backend entries.
#[derive(Clone, Debug)]
pub struct SegmentedSubnodeList {
    segment_size: usize,
    count: Option<usize>,
    stamp: u64,
    segments: BTreeMap<usize, Vec<NodeHandle>>,
    added: Vec<NodeHandle>,
    removed: Vec<NodeHandle>,
    /// Backend positions of removed entries seen in a loaded segment.
    removed_at: BTreeMap<usize, NodeHandle>,
}

impl SegmentedSubnodeList {
    /// Empty list fetching `segment_size` ids per backend round trip.
    pub fn new(segment_size: usize) -> Self {
        Self {
            segment_size: segment_size.max(1),
            count: None,
            stamp: 0,
            segments: BTreeMap::new(),
            added: Vec::new(),
            removed: Vec::new(),
            removed_at: BTreeMap::new(),
        }
    }

    /// Number of children.
    ///
    /// The backend count is reused until `stamp` moves past the stamp it was
    /// fetched at.
    pub fn size<F>(&mut self, stamp: u64, count: F) -> Result<usize>
    where
        F: FnOnce() -> Result<usize>,
    {
        self.sync(stamp);
        let base = match self.count {
            Some(n) => n,
            None => {
                let n = count()?;
                self.count = Some(n);
                n
            }
        };
        Ok(base.saturating_sub(self.removed.len()) + self.added.len())
    }

    /// Child at `index`, loading segments through `load(offset, limit)`.
    ///
    /// Expects [`SegmentedSubnodeList::size`] to have been called at the same
    /// stamp.
    pub fn get<F>(&mut self, stamp: u64, index: usize, mut load: F) -> Result<Option<NodeHandle>>
    where
        F: FnMut(usize, usize) -> Result<Vec<NodeHandle>>,
    {
        self.sync(stamp);
        let kept = self.count.unwrap_or(0).saturating_sub(self.removed.len());
        if index >= kept {
            return Ok(self.added.get(index - kept).cloned());
        }
        loop {
            let pos = self.backend_position(index);
            let segment = pos / self.segment_size;
            if !self.segments.contains_key(&segment) {
                let handles = load(segment * self.segment_size, self.segment_size)?;
                self.insert_segment(segment, handles);
                continue;
            }
            return Ok(self
                .segments
                .get(&segment)
                .and_then(|s| s.get(pos % self.segment_size))
                .cloned());
        }
    }

    /// Records a child added in memory.
    pub fn add(&mut self, handle: NodeHandle) {
        let before = self.removed.len();
        self.removed.retain(|h| h != &handle);
        self.removed_at.retain(|_, h| h != &handle);
        if self.removed.len() != before {
            return;
        }
        if !self.added.contains(&handle) {
            self.added.push(handle);
        }
    }

    /// Records a child removed in memory.
    pub fn remove(&mut self, handle: &NodeHandle) -> bool {
        let before = self.added.len();
        self.added.retain(|h| h != handle);
        if self.added.len() != before {
            return true;
        }
        if !self.removed.contains(handle) {
            self.removed.push(handle.clone());
            let seen = self.segments.iter().find_map(|(segment, handles)| {
                handles
                    .iter()
                    .position(|h| h == handle)
                    .map(|i| segment * self.segment_size + i)
            });
            if let Some(pos) = seen {
                self.removed_at.insert(pos, handle.clone());
            }
        }
        true
    }

    /// Handles materialized so far, including in-memory additions.
    pub fn loaded_handles(&self) -> Vec<NodeHandle> {
        self.segments
            .values()
            .flatten()
            .filter(|h| !self.removed.contains(h))
            .chain(self.added.iter())
            .cloned()
            .collect()
    }

    /// Whether `handle` is among the materialized children.
    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.added.contains(handle)
            || (!self.removed.contains(handle)
                && self.segments.values().any(|s| s.contains(handle)))
    }

    /// Backend position of the `index`-th surviving entry, skipping removed
    /// entries with a known position.
    fn backend_position(&self, index: usize) -> usize {
        let mut pos = index;
        for &removed in self.removed_at.keys() {
            if removed > pos {
                break;
            }
            pos += 1;
        }
        pos
    }

    fn insert_segment(&mut self, segment: usize, handles: Vec<NodeHandle>) {
        let offset = segment * self.segment_size;
        for (i, handle) in handles.iter().enumerate() {
            if self.removed.contains(handle) {
                self.removed_at.insert(offset + i, handle.clone());
            }
        }
        self.segments.insert(segment, handles);
    }

    fn sync(&mut self, stamp: u64) {
        if stamp > self.stamp {
            self.stamp = stamp;
            self.count = None;
            self.segments.clear();
            self.added.clear();
            self.removed.clear();
            self.removed_at.clear();
        }
    }
}
