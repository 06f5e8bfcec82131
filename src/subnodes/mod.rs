//! Ordered collections of child handles.

mod ordered;
mod segmented;
mod updateable;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::handle::NodeHandle;

pub use ordered::{OrderField, OrderSpec, OrderedSubnodeList, SortRow};
pub use segmented::SegmentedSubnodeList;
pub use updateable::{UpdateableSubnodeList, Watermark};

/// Plain child list in insertion order.
///
/// Alternate orderings requested through [`SubnodeList::ordered_view`] are
/// cached per expression and kept in sync with every add and remove.
#[derive(Clone, Debug, Default)]
pub struct SubnodeList {
    handles: Vec<NodeHandle>,
    views: FxHashMap<String, OrderedView>,
}

#[derive(Clone, Debug)]
struct OrderedView {
    list: OrderedSubnodeList,
    pending: Vec<NodeHandle>,
}

impl SubnodeList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// List over `handles` in the given order.
    pub fn from_handles(handles: Vec<NodeHandle>) -> Self {
        Self {
            handles,
            views: FxHashMap::default(),
        }
    }

    /// Inserts `handle` at `position` (appends when `None` or out of range).
    ///
    /// Returns the index it ended up at.
    pub fn add(&mut self, handle: NodeHandle, position: Option<usize>) -> usize {
        for view in self.views.values_mut() {
            view.pending.push(handle.clone());
        }
        match position {
            Some(pos) if pos < self.handles.len() => {
                self.handles.insert(pos, handle);
                pos
            }
            _ => {
                self.handles.push(handle);
                self.handles.len() - 1
            }
        }
    }

    /// Removes `handle` from the list and all views.
    pub fn remove(&mut self, handle: &NodeHandle) -> bool {
        for view in self.views.values_mut() {
            view.pending.retain(|h| h != handle);
            view.list.remove(handle);
        }
        match self.handles.iter().position(|h| h == handle) {
            Some(pos) => {
                self.handles.remove(pos);
                true
            }
            None => false,
        }
    }

    /// The children in this list's own order.
    pub fn handles(&self) -> &[NodeHandle] {
        &self.handles
    }

    /// Child at `index`.
    pub fn get(&self, index: usize) -> Option<&NodeHandle> {
        self.handles.get(index)
    }

    /// Index of `handle`.
    pub fn position(&self, handle: &NodeHandle) -> Option<usize> {
        self.handles.iter().position(|h| h == handle)
    }

    /// Whether `handle` is a member.
    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.position(handle).is_some()
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Children sorted by `spec`, derived once and then kept in sync.
    pub fn ordered_view<F>(&mut self, spec: &OrderSpec, lookup: &mut F) -> Result<Vec<NodeHandle>>
    where
        F: FnMut(&NodeHandle) -> Result<SortRow>,
    {
        if !self.views.contains_key(spec.expr()) {
            let mut list = OrderedSubnodeList::new(spec.clone());
            list.add_all(self.handles.clone(), false, lookup)?;
            self.views.insert(
                spec.expr().to_owned(),
                OrderedView {
                    list,
                    pending: Vec::new(),
                },
            );
        }
        let Some(view) = self.views.get_mut(spec.expr()) else {
            return Ok(Vec::new());
        };
        for handle in std::mem::take(&mut view.pending) {
            view.list.sort_in(handle, lookup)?;
        }
        Ok(view.list.handles().to_vec())
    }

    /// Drops the cached views whose ordering reads a field for which
    /// `affected` holds.
    pub fn drop_views_on<F>(&mut self, affected: F)
    where
        F: Fn(&str) -> bool,
    {
        self.views
            .retain(|_, view| !view.list.spec().fields().iter().any(|f| affected(&f.field)));
    }
}

/// The child list variant a node carries.
#[derive(Clone, Debug)]
pub enum Subnodes {
    /// Insertion ordered.
    Plain(SubnodeList),
    /// Kept in the relation's order.
    Ordered(OrderedSubnodeList),
    /// Materialized in segments.
    Segmented(SegmentedSubnodeList),
    /// Refreshed incrementally.
    Updateable(UpdateableSubnodeList),
}

impl Subnodes {
    /// Handles materialized in memory.
    pub fn handles(&self) -> Vec<NodeHandle> {
        match self {
            Subnodes::Plain(list) => list.handles().to_vec(),
            Subnodes::Ordered(list) => list.handles().to_vec(),
            Subnodes::Segmented(list) => list.loaded_handles(),
            Subnodes::Updateable(list) => list.list().handles().to_vec(),
        }
    }

    /// Whether `handle` is among the materialized children.
    pub fn contains(&self, handle: &NodeHandle) -> bool {
        match self {
            Subnodes::Plain(list) => list.contains(handle),
            Subnodes::Ordered(list) => list.position(handle).is_some(),
            Subnodes::Segmented(list) => list.contains(handle),
            Subnodes::Updateable(list) => list.list().contains(handle),
        }
    }

    /// Removes `handle`.
    pub fn remove(&mut self, handle: &NodeHandle) -> bool {
        match self {
            Subnodes::Plain(list) => list.remove(handle),
            Subnodes::Ordered(list) => list.remove(handle),
            Subnodes::Segmented(list) => list.remove(handle),
            Subnodes::Updateable(list) => list.list_mut().remove(handle),
        }
    }

    /// Number of materialized children.
    pub fn loaded_len(&self) -> usize {
        match self {
            Subnodes::Plain(list) => list.len(),
            Subnodes::Ordered(list) => list.len(),
            Subnodes::Segmented(list) => list.loaded_handles().len(),
            Subnodes::Updateable(list) => list.list().len(),
        }
    }
}

impl Default for Subnodes {
    fn default() -> Self {
        Subnodes::Plain(SubnodeList::new())
    }
}
