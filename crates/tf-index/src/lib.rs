#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IndexLabel {
    Int64(i64),
    Utf8(String),
}

impl From<i64> for IndexLabel {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for IndexLabel {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for IndexLabel {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl fmt::Display for IndexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl IndexLabel {
    /// Labels compare across kinds through their text form, so `"7"` finds `7`.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Int64(a), Self::Utf8(b)) | (Self::Utf8(b), Self::Int64(a)) => {
                b.trim().parse::<i64>().is_ok_and(|parsed| parsed == *a)
            }
        }
    }
}

/// Detected label order, used to pick binary search over a linear scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortOrder {
    Unsorted,
    /// All labels are `Int64` and strictly ascending.
    AscendingInt64,
}

fn detect_sort_order(labels: &[IndexLabel]) -> SortOrder {
    let ascending = labels.windows(2).all(|w| match (&w[0], &w[1]) {
        (IndexLabel::Int64(a), IndexLabel::Int64(b)) => a < b,
        _ => false,
    });
    let all_int = labels.iter().all(|l| matches!(l, IndexLabel::Int64(_)));
    if ascending && all_int {
        SortOrder::AscendingInt64
    } else {
        SortOrder::Unsorted
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("label {0} not found in index")]
    LabelNotFound(String),
    #[error("index length {index} does not match row count {rows}")]
    LengthMismatch { index: usize, rows: usize },
}

/// Row labels of a frame. Duplicates are allowed; lookups return the first match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    labels: Vec<IndexLabel>,
    #[serde(skip)]
    sort_order_cache: OnceLock<SortOrder>,
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl Eq for Index {}

impl Index {
    #[must_use]
    pub fn new(labels: Vec<IndexLabel>) -> Self {
        Self {
            labels,
            sort_order_cache: OnceLock::new(),
        }
    }

    /// Default labels `0..len`.
    #[must_use]
    pub fn range(len: usize) -> Self {
        Self::new((0..len as i64).map(IndexLabel::Int64).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[must_use]
    pub fn labels(&self) -> &[IndexLabel] {
        &self.labels
    }

    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.labels.len());
        !self.labels.iter().all(|label| seen.insert(label))
    }

    fn sort_order(&self) -> SortOrder {
        *self
            .sort_order_cache
            .get_or_init(|| detect_sort_order(&self.labels))
    }

    /// First position whose label matches `needle`.
    #[must_use]
    pub fn position(&self, needle: &IndexLabel) -> Option<usize> {
        match (self.sort_order(), needle) {
            (SortOrder::AscendingInt64, IndexLabel::Int64(target)) => self
                .labels
                .binary_search_by(|label| match label {
                    IndexLabel::Int64(v) => v.cmp(target),
                    IndexLabel::Utf8(_) => std::cmp::Ordering::Less,
                })
                .ok(),
            _ => self.labels.iter().position(|label| label.matches(needle)),
        }
    }

    pub fn push(&mut self, label: IndexLabel) {
        self.labels.push(label);
        self.sort_order_cache = OnceLock::new();
    }

    /// Last position whose label matches `needle`.
    #[must_use]
    pub fn last_position(&self, needle: &IndexLabel) -> Option<usize> {
        self.labels.iter().rposition(|label| label.matches(needle))
    }

    pub fn require_position(&self, needle: &IndexLabel) -> Result<usize, IndexError> {
        self.position(needle)
            .ok_or_else(|| IndexError::LabelNotFound(needle.to_string()))
    }

    /// Inclusive position range from the first `start` to the last `end`.
    /// Empty when `end` occurs before `start`.
    pub fn slice_positions(
        &self,
        start: &IndexLabel,
        end: &IndexLabel,
    ) -> Result<Vec<usize>, IndexError> {
        let first = self.require_position(start)?;
        let last = self
            .last_position(end)
            .ok_or_else(|| IndexError::LabelNotFound(end.to_string()))?;
        Ok(if last < first {
            Vec::new()
        } else {
            (first..=last).collect()
        })
    }

    #[must_use]
    pub fn position_map_first(&self) -> HashMap<IndexLabel, usize> {
        let mut positions = HashMap::with_capacity(self.labels.len());
        for (idx, label) in self.labels.iter().enumerate() {
            positions.entry(label.clone()).or_insert(idx);
        }
        positions
    }

    #[must_use]
    pub fn contains(&self, label: &IndexLabel) -> bool {
        self.position(label).is_some()
    }

    /// Labels at `positions`; callers pass positions already bounds-checked
    /// against the owning frame.
    #[must_use]
    pub fn take(&self, positions: &[usize]) -> Self {
        Self::new(
            positions
                .iter()
                .filter_map(|&i| self.labels.get(i).cloned())
                .collect(),
        )
    }

    pub fn check_len(&self, rows: usize) -> Result<(), IndexError> {
        if self.len() == rows {
            Ok(())
        } else {
            Err(IndexError::LengthMismatch {
                index: self.len(),
                rows,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Index, IndexError, IndexLabel};

    #[test]
    fn duplicate_labels_resolve_to_first_match() {
        let index = Index::new(vec!["b".into(), "a".into(), "b".into()]);
        assert!(index.has_duplicates());
        assert_eq!(index.position(&"b".into()), Some(0));
        assert_eq!(index.last_position(&"b".into()), Some(2));
        assert_eq!(index.position(&"z".into()), None);
    }

    #[test]
    fn sorted_int_index_uses_binary_search() {
        let index = Index::range(1000);
        assert_eq!(index.position(&IndexLabel::Int64(737)), Some(737));
        assert_eq!(index.position(&IndexLabel::Int64(1000)), None);
    }

    #[test]
    fn stringified_int_labels_match_int_labels() {
        let index = Index::new(vec![IndexLabel::Int64(10), IndexLabel::Int64(3)]);
        assert_eq!(index.position(&"3".into()), Some(1));
        let text = Index::new(vec!["10".into(), "3".into()]);
        assert_eq!(text.position(&IndexLabel::Int64(3)), Some(1));
    }

    #[test]
    fn slice_positions_is_inclusive() {
        let index = Index::new(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        assert_eq!(
            index
                .slice_positions(&"b".into(), &"c".into())
                .expect("slice"),
            vec![1, 2]
        );
        assert!(
            index
                .slice_positions(&"c".into(), &"a".into())
                .expect("reversed")
                .is_empty()
        );
        assert_eq!(
            index.slice_positions(&"x".into(), &"a".into()),
            Err(IndexError::LabelNotFound("x".to_owned()))
        );
    }

    #[test]
    fn take_and_first_position_map() {
        let index = Index::new(vec![7.into(), 8.into(), 7.into()]);
        let taken = index.take(&[2, 1]);
        assert_eq!(taken.labels(), &[IndexLabel::Int64(7), IndexLabel::Int64(8)]);
        assert_eq!(index.position_map_first()[&IndexLabel::Int64(7)], 0);
        assert!(index.check_len(3).is_ok());
        assert!(index.check_len(2).is_err());
    }

    #[test]
    fn serde_skips_cache() {
        let index = Index::new(vec![1.into(), "x".into()]);
        let json = serde_json::to_string(&index).expect("serialize");
        let back: Index = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(index, back);
    }
}
