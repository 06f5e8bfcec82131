use std::cmp::Ordering;

use crate::handle::NodeHandle;
use crate::value::Value;

use super::SubnodeList;

/// Lowest and highest value seen for one update criterion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Watermark {
    /// Smallest observed value.
    pub lowest: Option<Value>,
    /// Largest observed value.
    pub highest: Option<Value>,
}

impl Watermark {
    fn observe(&mut self, value: &Value) {
        if self
            .lowest
            .as_ref()
            .map_or(true, |low| value.compare(low) == Ordering::Less)
        {
            self.lowest = Some(value.clone());
        }
        if self
            .highest
            .as_ref()
            .map_or(true, |high| value.compare(high) == Ordering::Greater)
        {
            self.highest = Some(value.clone());
        }
    }
}

/// Child list refreshed incrementally.
///
/// Tracks watermarks over the update criteria columns so a refresh asks the
/// backend only for rows above the highest or below the lowest value seen.
#[derive(Clone, Debug)]
pub struct UpdateableSubnodeList {
    list: SubnodeList,
    criteria: Vec<String>,
    marks: Vec<Watermark>,
}

impl UpdateableSubnodeList {
    /// Empty list tracking `criteria` columns.
    pub fn new(criteria: Vec<String>) -> Self {
        let marks = vec![Watermark::default(); criteria.len()];
        Self {
            list: SubnodeList::new(),
            criteria,
            marks,
        }
    }

    /// Update criteria columns.
    pub fn criteria(&self) -> &[String] {
        &self.criteria
    }

    /// Watermarks, one per criterion.
    pub fn watermarks(&self) -> &[Watermark] {
        &self.marks
    }

    /// Whether any row has been observed yet.
    pub fn has_watermark(&self) -> bool {
        self.marks.iter().any(|m| m.highest.is_some())
    }

    /// Appends rows returned by a refresh query and advances the watermarks.
    ///
    /// `rows` pairs each handle with its criteria values. Returns the number
    /// of handles that were not already present.
    pub fn apply_update(&mut self, rows: Vec<(NodeHandle, Vec<Option<Value>>)>) -> usize {
        let mut added = 0;
        for (handle, values) in rows {
            for (mark, value) in self.marks.iter_mut().zip(values.iter()) {
                if let Some(value) = value {
                    mark.observe(value);
                }
            }
            if !self.list.contains(&handle) {
                self.list.add(handle, None);
                added += 1;
            }
        }
        added
    }

    /// Plain list view.
    pub fn list(&self) -> &SubnodeList {
        &self.list
    }

    /// Mutable plain list view.
    pub fn list_mut(&mut self) -> &mut SubnodeList {
        &mut self.list
    }
}
