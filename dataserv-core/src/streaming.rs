//! Streaming containers: list-like values whose mutations are recorded
//! in an operation log so they can be transported as deltas instead of
//! full snapshots.
//!
//! Every container carries an opaque [`StreamToken`] identifying it
//! across the wire. Receivers keep a registry keyed by token and merge
//! incoming logs into their local replica.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::DataValue;

// ── StreamToken ──────────────────────────────────────────────────

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque process-unique identity of a streaming container.
///
/// Tokens are minted from a process-wide counter and never reused
/// within a process. Two containers with the same token refer to the
/// same logical stream across a source/sink pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamToken(u64);

impl StreamToken {
    /// Mint a fresh token, distinct from every token minted before it
    /// in this process.
    pub fn mint() -> Self {
        StreamToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

// ── ListOp ───────────────────────────────────────────────────────

/// One recorded mutation of a [`StreamingList`].
///
/// Indices are interpreted against the receiving replica's state at
/// the moment the record is applied, in log order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListOp {
    /// Insert `value` so that it ends up at position `index`.
    Insert { index: usize, value: DataValue },
    /// Remove the item at position `index`.
    Delete { index: usize },
    /// Replace the item at position `index` with `value`.
    Update { index: usize, value: DataValue },
}

// ── StreamingList ────────────────────────────────────────────────

/// A list that records its own mutations.
///
/// The log is local-only state: it is drained by [`take_log`] when a
/// snapshot is cut and replayed by [`merge`] on the receiving side.
/// Equality compares items only.
///
/// [`take_log`]: StreamingList::take_log
/// [`merge`]: StreamingList::merge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingList {
    #[serde(skip, default = "StreamToken::mint")]
    token: StreamToken,
    items: Vec<DataValue>,
    #[serde(skip)]
    log: Vec<ListOp>,
}

impl Default for StreamingList {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StreamingList {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl StreamingList {
    /// An empty container with a fresh token and an empty log.
    pub fn new() -> Self {
        StreamingList {
            token: StreamToken::mint(),
            items: Vec::new(),
            log: Vec::new(),
        }
    }

    /// Build a container from existing items. The initial contents are
    /// logged as insertions so a first delta reproduces them.
    pub fn from_items(items: Vec<DataValue>) -> Self {
        let log = items
            .iter()
            .enumerate()
            .map(|(index, value)| ListOp::Insert {
                index,
                value: value.clone(),
            })
            .collect();
        StreamingList {
            token: StreamToken::mint(),
            items,
            log,
        }
    }

    /// Rebuild a replica with a known token, used when reconstructing a
    /// received snapshot.
    pub(crate) fn with_token(token: StreamToken) -> Self {
        StreamingList {
            token,
            items: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn token(&self) -> StreamToken {
        self.token
    }

    pub fn items(&self) -> &[DataValue] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DataValue> {
        self.items.get(index)
    }

    /// Whether the container holds recorded mutations that have not
    /// been drained yet.
    pub fn is_dirty(&self) -> bool {
        !self.log.is_empty()
    }

    /// Number of pending mutation records.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Insert `value` at `index`. An index past the end appends, like
    /// list insertion semantics everywhere.
    pub fn insert(&mut self, index: usize, value: impl Into<DataValue>) {
        let index = index.min(self.items.len());
        let value = value.into();
        self.items.insert(index, value.clone());
        self.log.push(ListOp::Insert { index, value });
    }

    /// Append `value` at the end.
    pub fn push(&mut self, value: impl Into<DataValue>) {
        let index = self.items.len();
        let value = value.into();
        self.items.push(value.clone());
        self.log.push(ListOp::Insert { index, value });
    }

    /// Append every value in `iter`.
    pub fn extend(&mut self, iter: impl IntoIterator<Item = DataValue>) {
        for value in iter {
            self.push(value);
        }
    }

    /// Remove and return the item at `index`.
    pub fn remove(&mut self, index: usize) -> Result<DataValue> {
        if index >= self.items.len() {
            return Err(Error::InvalidMutation {
                op: "delete",
                index,
            });
        }
        let value = self.items.remove(index);
        self.log.push(ListOp::Delete { index });
        Ok(value)
    }

    /// Remove the first item equal to `value`. Returns whether a
    /// match was found.
    pub fn remove_value(&mut self, value: &DataValue) -> bool {
        match self.items.iter().position(|v| v == value) {
            Some(index) => {
                self.items.remove(index);
                self.log.push(ListOp::Delete { index });
                true
            }
            None => false,
        }
    }

    /// Remove and return the last item, if any.
    pub fn pop(&mut self) -> Option<DataValue> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.items.len() - 1;
        let value = self.items.pop()?;
        self.log.push(ListOp::Delete { index });
        Some(value)
    }

    /// Replace the item at `index`.
    pub fn set(&mut self, index: usize, value: impl Into<DataValue>) -> Result<()> {
        if index >= self.items.len() {
            return Err(Error::InvalidMutation {
                op: "update",
                index,
            });
        }
        let value = value.into();
        self.items[index] = value.clone();
        self.log.push(ListOp::Update { index, value });
        Ok(())
    }

    /// Re-record the item at `index` as updated. Call after mutating a
    /// nested value in place so the change reaches replicas.
    pub fn mark_updated(&mut self, index: usize) -> Result<()> {
        let value = self
            .items
            .get(index)
            .cloned()
            .ok_or(Error::InvalidMutation {
                op: "update",
                index,
            })?;
        self.log.push(ListOp::Update { index, value });
        Ok(())
    }

    /// Remove every item. Logged as repeated front deletions so a
    /// replica of any equal length converges to empty.
    pub fn clear(&mut self) {
        for _ in 0..self.items.len() {
            self.log.push(ListOp::Delete { index: 0 });
        }
        self.items.clear();
    }

    /// Sort items with the total value order. The whole list is
    /// re-recorded as updates.
    pub fn sort(&mut self) {
        self.items.sort_by(|a, b| a.total_cmp(b));
        self.log_full_rewrite();
    }

    /// Reverse the item order. The whole list is re-recorded.
    pub fn reverse(&mut self) {
        self.items.reverse();
        self.log_full_rewrite();
    }

    fn log_full_rewrite(&mut self) {
        for (index, value) in self.items.iter().enumerate() {
            self.log.push(ListOp::Update {
                index,
                value: value.clone(),
            });
        }
    }

    /// An independent copy with the same items, a fresh token, and a
    /// clean log. The copy is a new stream, not a replica.
    pub fn copy(&self) -> Self {
        StreamingList {
            token: StreamToken::mint(),
            items: self.items.clone(),
            log: Vec::new(),
        }
    }

    // ── Log transport ────────────────────────────────────────────

    /// Drain the pending mutation log, leaving the container clean.
    pub fn take_log(&mut self) -> Vec<ListOp> {
        std::mem::take(&mut self.log)
    }

    /// Replay a received mutation log against this replica.
    ///
    /// Fails with [`Error::DirtyMergeTarget`] if this container has
    /// unflushed local mutations, and with [`Error::InvalidMutation`]
    /// if a record references an out-of-range index. On failure the
    /// replica may be partially updated and should be discarded.
    pub fn merge(&mut self, log: &[ListOp]) -> Result<()> {
        if self.is_dirty() {
            return Err(Error::DirtyMergeTarget);
        }
        for op in log {
            match op {
                ListOp::Insert { index, value } => {
                    if *index > self.items.len() {
                        return Err(Error::InvalidMutation {
                            op: "insert",
                            index: *index,
                        });
                    }
                    self.items.insert(*index, value.clone());
                }
                ListOp::Delete { index } => {
                    if *index >= self.items.len() {
                        return Err(Error::InvalidMutation {
                            op: "delete",
                            index: *index,
                        });
                    }
                    self.items.remove(*index);
                }
                ListOp::Update { index, value } => {
                    if *index >= self.items.len() {
                        return Err(Error::InvalidMutation {
                            op: "update",
                            index: *index,
                        });
                    }
                    self.items[*index] = value.clone();
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<DataValue> for StreamingList {
    fn from_iter<T: IntoIterator<Item = DataValue>>(iter: T) -> Self {
        StreamingList::from_items(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(list: &StreamingList) -> Vec<i64> {
        list.items()
            .iter()
            .map(|v| match v {
                DataValue::Int(i) => *i,
                other => panic!("unexpected value {other:?}"),
            })
            .collect()
    }

    #[test]
    fn tokens_are_unique() {
        let a = StreamToken::mint();
        let b = StreamToken::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn push_and_log() {
        let mut list = StreamingList::new();
        list.push(1);
        list.push(2);
        assert_eq!(ints(&list), vec![1, 2]);
        assert!(list.is_dirty());
        let log = list.take_log();
        assert_eq!(log.len(), 2);
        assert!(!list.is_dirty());
    }

    #[test]
    fn from_items_logs_initial_contents() {
        let mut list = StreamingList::from_items(vec![1.into(), 2.into(), 3.into()]);
        let log = list.take_log();
        let mut replica = StreamingList::with_token(list.token());
        replica.merge(&log).unwrap();
        assert_eq!(replica, list);
    }

    #[test]
    fn merge_replays_mutations() {
        let mut source = StreamingList::new();
        let mut replica = StreamingList::with_token(source.token());

        source.push(1);
        source.push(2);
        source.push(3);
        replica.merge(&source.take_log()).unwrap();
        assert_eq!(ints(&replica), vec![1, 2, 3]);

        source.remove(1).unwrap();
        source.set(0, 10).unwrap();
        source.insert(1, 20);
        replica.merge(&source.take_log()).unwrap();
        assert_eq!(ints(&replica), ints(&source));
        assert_eq!(ints(&replica), vec![10, 20, 3]);
    }

    #[test]
    fn merge_empty_log_is_identity() {
        let mut list = StreamingList::from_items(vec![1.into(), 2.into()]);
        list.take_log();
        let before = list.clone();
        list.merge(&[]).unwrap();
        assert_eq!(list, before);
    }

    #[test]
    fn merge_into_dirty_target_fails() {
        let mut source = StreamingList::new();
        source.push(1);
        let log = source.take_log();

        let mut replica = StreamingList::new();
        replica.push(99);
        assert!(matches!(replica.merge(&log), Err(Error::DirtyMergeTarget)));
    }

    #[test]
    fn merge_rejects_out_of_range() {
        let mut replica = StreamingList::new();
        let log = [ListOp::Delete { index: 0 }];
        assert!(matches!(
            replica.merge(&log),
            Err(Error::InvalidMutation { op: "delete", .. })
        ));
    }

    #[test]
    fn clear_converges_replica() {
        let mut source = StreamingList::new();
        let mut replica = StreamingList::with_token(source.token());
        source.extend([1.into(), 2.into(), 3.into()]);
        replica.merge(&source.take_log()).unwrap();

        source.clear();
        replica.merge(&source.take_log()).unwrap();
        assert!(replica.is_empty());
    }

    #[test]
    fn sort_and_reverse_converge_replica() {
        let mut source = StreamingList::new();
        let mut replica = StreamingList::with_token(source.token());
        source.extend([3.into(), 1.into(), 2.into()]);
        replica.merge(&source.take_log()).unwrap();

        source.sort();
        replica.merge(&source.take_log()).unwrap();
        assert_eq!(ints(&replica), vec![1, 2, 3]);

        source.reverse();
        replica.merge(&source.take_log()).unwrap();
        assert_eq!(ints(&replica), vec![3, 2, 1]);
    }

    #[test]
    fn mark_updated_re_records_item() {
        let mut source = StreamingList::new();
        source.push(1);
        source.take_log();
        source.mark_updated(0).unwrap();
        let log = source.take_log();
        assert!(matches!(log[0], ListOp::Update { index: 0, .. }));
        assert!(source.mark_updated(5).is_err());
    }

    #[test]
    fn copy_mints_fresh_token() {
        let mut source = StreamingList::new();
        source.push(1);
        let copy = source.copy();
        assert_ne!(copy.token(), source.token());
        assert_eq!(copy, source);
        assert!(!copy.is_dirty());
    }

    #[test]
    fn remove_value_deletes_first_match() {
        let mut source = StreamingList::new();
        let mut replica = StreamingList::with_token(source.token());
        source.extend([1.into(), 2.into(), 1.into()]);
        replica.merge(&source.take_log()).unwrap();

        assert!(source.remove_value(&DataValue::Int(1)));
        assert!(!source.remove_value(&DataValue::Int(9)));
        replica.merge(&source.take_log()).unwrap();
        assert_eq!(ints(&replica), vec![2, 1]);
    }

    #[test]
    fn pop_from_empty() {
        let mut list = StreamingList::new();
        assert!(list.pop().is_none());
        assert!(!list.is_dirty());
    }

    #[test]
    fn serde_skips_log_and_remints_token() {
        let mut list = StreamingList::new();
        list.push(7);
        let bytes = bincode::serialize(&list).unwrap();
        let decoded: StreamingList = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, list);
        assert!(!decoded.is_dirty());
        assert_ne!(decoded.token(), list.token());
    }
}
