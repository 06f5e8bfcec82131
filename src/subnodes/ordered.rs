use std::cmp::Ordering;

use crate::error::{Result, StoreError};
use crate::handle::NodeHandle;
use crate::value::Value;

/// Values of the ordering fields of one node, in [`OrderSpec`] order.
pub type SortRow = Vec<Option<Value>>;

/// One `field [asc|desc]` term of an ordering expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderField {
    /// Column or property name.
    pub field: String,
    /// Whether larger values come first.
    pub descending: bool,
}

/// Parsed multi-key ordering expression such as `"title asc, created desc"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderSpec {
    expr: String,
    fields: Vec<OrderField>,
}

impl OrderSpec {
    /// Parses a comma separated ordering expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut fields = Vec::new();
        for term in expr.split(',') {
            let mut parts = term.split_whitespace();
            let Some(field) = parts.next() else {
                return Err(StoreError::Invalid("empty ordering term"));
            };
            let descending = match parts.next() {
                None => false,
                Some(dir) if dir.eq_ignore_ascii_case("asc") => false,
                Some(dir) if dir.eq_ignore_ascii_case("desc") => true,
                Some(_) => return Err(StoreError::Invalid("ordering direction must be asc or desc")),
            };
            if parts.next().is_some() {
                return Err(StoreError::Invalid("malformed ordering term"));
            }
            fields.push(OrderField {
                field: field.to_owned(),
                descending,
            });
        }
        Ok(Self {
            expr: expr.trim().to_owned(),
            fields,
        })
    }

    /// The expression this spec was parsed from.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Ordering terms.
    pub fn fields(&self) -> &[OrderField] {
        &self.fields
    }

    /// Composite comparison of two sort rows. Missing values sort first.
    pub fn compare(&self, a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
        for (i, field) in self.fields.iter().enumerate() {
            let ord = match (a.get(i).and_then(Option::as_ref), b.get(i).and_then(Option::as_ref)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.compare(y),
            };
            let ord = if field.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Child list kept in the order of an [`OrderSpec`].
///
/// Sort rows are fetched through the caller's lookup the first time an
/// element takes part in a comparison and remembered afterwards.
#[derive(Clone, Debug)]
pub struct OrderedSubnodeList {
    spec: OrderSpec,
    handles: Vec<NodeHandle>,
    rows: Vec<Option<SortRow>>,
}

impl OrderedSubnodeList {
    /// Empty list.
    pub fn new(spec: OrderSpec) -> Self {
        Self {
            spec,
            handles: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// List over handles already in `spec` order, e.g. from an ordered query.
    pub fn from_sorted(spec: OrderSpec, handles: Vec<NodeHandle>) -> Self {
        let rows = vec![None; handles.len()];
        Self { spec, handles, rows }
    }

    /// Ordering of this list.
    pub fn spec(&self) -> &OrderSpec {
        &self.spec
    }

    /// Inserts `handle` after every element that does not sort after it.
    ///
    /// Returns the insertion index.
    pub fn sort_in<F>(&mut self, handle: NodeHandle, lookup: &mut F) -> Result<usize>
    where
        F: FnMut(&NodeHandle) -> Result<SortRow>,
    {
        let row = lookup(&handle)?;
        let pos = self.upper_bound(&row, lookup)?;
        self.handles.insert(pos, handle);
        self.rows.insert(pos, Some(row));
        Ok(pos)
    }

    /// Adds a batch of handles.
    ///
    /// When `sorted` is set the batch is trusted to be in `spec` order and is
    /// appended or merged; otherwise each element is sorted in individually.
    pub fn add_all<F>(&mut self, batch: Vec<NodeHandle>, sorted: bool, lookup: &mut F) -> Result<()>
    where
        F: FnMut(&NodeHandle) -> Result<SortRow>,
    {
        if batch.is_empty() {
            return Ok(());
        }
        if !sorted {
            for handle in batch {
                self.sort_in(handle, lookup)?;
            }
            return Ok(());
        }

        let mut incoming = Vec::with_capacity(batch.len());
        for handle in batch {
            let row = lookup(&handle)?;
            incoming.push((handle, row));
        }
        if self.handles.is_empty() {
            for (handle, row) in incoming {
                self.handles.push(handle);
                self.rows.push(Some(row));
            }
            return Ok(());
        }
        let last = self.handles.len() - 1;
        self.ensure_row(last, lookup)?;
        let appendable = self.rows[last]
            .as_deref()
            .is_some_and(|tail| self.spec.compare(tail, &incoming[0].1) != Ordering::Greater);
        if appendable {
            for (handle, row) in incoming {
                self.handles.push(handle);
                self.rows.push(Some(row));
            }
            return Ok(());
        }

        for i in 0..self.handles.len() {
            self.ensure_row(i, lookup)?;
        }
        let old_handles = std::mem::take(&mut self.handles);
        let old_rows = std::mem::take(&mut self.rows);
        let mut old = old_handles.into_iter().zip(old_rows).peekable();
        let mut new = incoming.into_iter().peekable();
        loop {
            let take_old = match (old.peek(), new.peek()) {
                (Some((_, Some(a))), Some((_, b))) => self.spec.compare(a, b) != Ordering::Greater,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some((_, None)), Some(_)) => true,
                (None, None) => break,
            };
            if take_old {
                if let Some((handle, row)) = old.next() {
                    self.handles.push(handle);
                    self.rows.push(row);
                }
            } else if let Some((handle, row)) = new.next() {
                self.handles.push(handle);
                self.rows.push(Some(row));
            }
        }
        Ok(())
    }

    /// Removes `handle`, returning whether it was present.
    pub fn remove(&mut self, handle: &NodeHandle) -> bool {
        match self.position(handle) {
            Some(pos) => {
                self.handles.remove(pos);
                self.rows.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Moves `handle` to where its current sort row puts it, e.g. after one
    /// of its ordering fields changed.
    ///
    /// Returns the new index, or `None` when `handle` is not a member.
    pub fn resort<F>(&mut self, handle: &NodeHandle, lookup: &mut F) -> Result<Option<usize>>
    where
        F: FnMut(&NodeHandle) -> Result<SortRow>,
    {
        let Some(pos) = self.position(handle) else {
            return Ok(None);
        };
        let handle = self.handles.remove(pos);
        self.rows.remove(pos);
        self.sort_in(handle, lookup).map(Some)
    }

    /// Index of `handle`.
    pub fn position(&self, handle: &NodeHandle) -> Option<usize> {
        self.handles.iter().position(|h| h == handle)
    }

    /// Handles in order.
    pub fn handles(&self) -> &[NodeHandle] {
        &self.handles
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn upper_bound<F>(&mut self, row: &[Option<Value>], lookup: &mut F) -> Result<usize>
    where
        F: FnMut(&NodeHandle) -> Result<SortRow>,
    {
        let (mut lo, mut hi) = (0, self.handles.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.ensure_row(mid, lookup)?;
            let greater = self.rows[mid]
                .as_deref()
                .is_some_and(|mid_row| self.spec.compare(mid_row, row) == Ordering::Greater);
            if greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    fn ensure_row<F>(&mut self, index: usize, lookup: &mut F) -> Result<()>
    where
        F: FnMut(&NodeHandle) -> Result<SortRow>,
    {
        if self.rows[index].is_none() {
            let row = lookup(&self.handles[index])?;
            self.rows[index] = Some(row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rustc_hash::FxHashMap;

    fn rows(entries: &[(&str, &str, i64)]) -> FxHashMap<Key, SortRow> {
        entries
            .iter()
            .map(|(id, title, score)| {
                (
                    Key::embedded(*id),
                    vec![Some(Value::from(*title)), Some(Value::Int(*score))],
                )
            })
            .collect()
    }

    fn lookup_in(table: &FxHashMap<Key, SortRow>) -> impl FnMut(&NodeHandle) -> Result<SortRow> + '_ {
        move |h| {
            h.key()
                .and_then(|k| table.get(&k).cloned())
                .ok_or(StoreError::Invalid("unknown handle"))
        }
    }

    fn handle(id: &str) -> NodeHandle {
        NodeHandle::from_key(Key::embedded(id))
    }

    #[test]
    fn parses_ordering_expressions() -> Result<()> {
        let spec = OrderSpec::parse("title asc, score DESC ,created")?;
        assert_eq!(spec.fields().len(), 3);
        assert!(!spec.fields()[0].descending);
        assert!(spec.fields()[1].descending);
        assert!(!spec.fields()[2].descending);
        assert!(OrderSpec::parse("title sideways").is_err());
        assert!(OrderSpec::parse("title,,score").is_err());
        Ok(())
    }

    #[test]
    fn sort_in_respects_composite_order() -> Result<()> {
        let table = rows(&[("1", "b", 1), ("2", "a", 5), ("3", "b", 9), ("4", "a", 7)]);
        let mut lookup = lookup_in(&table);
        let mut list = OrderedSubnodeList::new(OrderSpec::parse("title asc, score desc")?);
        for id in ["1", "2", "3", "4"] {
            list.sort_in(handle(id), &mut lookup)?;
        }
        let ids: Vec<_> = list.handles().iter().filter_map(|h| h.key()).collect();
        assert_eq!(
            ids,
            vec![
                Key::embedded("4"),
                Key::embedded("2"),
                Key::embedded("3"),
                Key::embedded("1")
            ]
        );
        Ok(())
    }

    #[test]
    fn sorted_batch_merges_into_existing() -> Result<()> {
        let table = rows(&[("1", "a", 0), ("2", "c", 0), ("3", "b", 0), ("4", "d", 0)]);
        let mut lookup = lookup_in(&table);
        let spec = OrderSpec::parse("title")?;
        let mut list = OrderedSubnodeList::from_sorted(spec, vec![handle("1"), handle("2")]);
        list.add_all(vec![handle("3"), handle("4")], true, &mut lookup)?;
        let titles: Vec<_> = list.handles().iter().filter_map(|h| h.key()).map(|k| k.id().to_owned()).collect();
        assert_eq!(titles, vec!["1", "3", "2", "4"]);
        assert!(list.remove(&handle("3")));
        assert_eq!(list.len(), 3);
        Ok(())
    }

    #[test]
    fn insertion_order_does_not_change_the_result() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let table: FxHashMap<Key, SortRow> = (0..200)
            .map(|i| {
                let title = ["a", "b", "c", "d"][rng.gen_range(0..4)];
                let score = rng.gen_range(-20i64..20);
                (
                    Key::embedded(i.to_string()),
                    vec![Some(Value::from(title)), Some(Value::Int(score))],
                )
            })
            .collect();
        let spec = OrderSpec::parse("title asc, score desc")?;
        let mut ids: Vec<usize> = (0..200).collect();
        let mut expected: Option<Vec<SortRow>> = None;
        for _ in 0..5 {
            ids.shuffle(&mut rng);
            let mut lookup = lookup_in(&table);
            let mut list = OrderedSubnodeList::new(spec.clone());
            for id in &ids {
                list.sort_in(handle(&id.to_string()), &mut lookup)?;
            }
            let sorted: Vec<SortRow> = list
                .handles()
                .iter()
                .filter_map(|h| h.key())
                .map(|k| table[&k].clone())
                .collect();
            match &expected {
                Some(first) => assert_eq!(&sorted, first),
                None => expected = Some(sorted),
            }
        }
        Ok(())
    }

    #[test]
    fn resort_moves_a_changed_element() -> Result<()> {
        let mut table = rows(&[("1", "a", 0), ("2", "b", 0), ("3", "c", 0)]);
        let spec = OrderSpec::parse("title")?;
        let mut list = OrderedSubnodeList::new(spec);
        {
            let mut lookup = lookup_in(&table);
            for id in ["1", "2", "3"] {
                list.sort_in(handle(id), &mut lookup)?;
            }
        }
        table.insert(Key::embedded("1"), vec![Some(Value::from("z")), Some(Value::Int(0))]);
        let mut lookup = lookup_in(&table);
        assert_eq!(list.resort(&handle("1"), &mut lookup)?, Some(2));
        assert_eq!(list.handles(), &[handle("2"), handle("3"), handle("1")]);
        assert_eq!(list.resort(&handle("9"), &mut lookup)?, None);
        Ok(())
    }

    proptest! {
        #[test]
        fn sort_in_keeps_adjacent_pairs_ordered(
            entries in proptest::collection::vec(("[a-d]", -5i64..5), 1..40)
        ) {
            let spec = OrderSpec::parse("title asc, score desc").unwrap();
            let table: FxHashMap<Key, SortRow> = entries
                .iter()
                .enumerate()
                .map(|(i, (t, s))| (Key::embedded(i.to_string()), vec![Some(Value::from(t.as_str())), Some(Value::Int(*s))]))
                .collect();
            let mut lookup = lookup_in(&table);
            let mut list = OrderedSubnodeList::new(spec.clone());
            for i in 0..entries.len() {
                list.sort_in(handle(&i.to_string()), &mut lookup).unwrap();
            }
            prop_assert_eq!(list.len(), entries.len());
            for pair in list.handles().windows(2) {
                let a = &table[&pair[0].key().unwrap()];
                let b = &table[&pair[1].key().unwrap()];
                prop_assert_ne!(spec.compare(a, b), Ordering::Greater);
            }
        }
    }
}
