//! The diff engine: snapshot + per-stream mutation logs.
//!
//! A [`Diff`] is what actually travels on the wire for a data update.
//! The snapshot carries the full value tree, but every streaming
//! container inside it is lowered to its identity token; the container
//! contents travel only once, as mutation logs keyed by token. A
//! receiver keeps a registry of replicas per token and applies logs
//! incrementally, so consumers holding references into the tree see
//! updates in place instead of wholesale replacement.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::streaming::{ListOp, StreamToken, StreamingList};
use crate::value::DataValue;

// ── Wire form ────────────────────────────────────────────────────

/// The snapshot-side mirror of [`DataValue`]: identical except that
/// streaming containers appear as bare tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Stream(StreamToken),
}

// ── Diff ─────────────────────────────────────────────────────────

/// One transportable state update: a full snapshot plus the pending
/// mutation logs of every streaming container reachable from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    snapshot: Vec<u8>,
    logs: BTreeMap<StreamToken, Vec<ListOp>>,
}

impl Diff {
    /// An empty diff: squashing into it acts as plain assignment.
    pub fn new() -> Self {
        Diff::default()
    }

    /// Whether this diff carries no snapshot yet.
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty() && self.logs.is_empty()
    }

    /// Cut a diff from `value`, draining the mutation log of every
    /// streaming container inside it.
    pub fn capture(value: &mut DataValue) -> Result<Diff> {
        let mut logs = BTreeMap::new();
        let wire = lower(value, &mut logs);
        let snapshot = bincode::serialize(&wire)?;
        Ok(Diff { snapshot, logs })
    }

    /// Coalesce `incoming` into `self`: the newer snapshot wins and
    /// every incoming log is appended to the matching token's backlog.
    /// Squashing is associative, so backlogs may be coalesced in any
    /// grouping without changing the reconstructed result.
    pub fn squash(&mut self, incoming: Diff) {
        self.snapshot = incoming.snapshot;
        for (token, mut log) in incoming.logs {
            self.logs.entry(token).or_default().append(&mut log);
        }
    }

    /// Total number of mutation records held across all logs.
    pub fn op_count(&self) -> usize {
        self.logs.values().map(Vec::len).sum()
    }

    /// Rebuild the value tree, replaying logs into `registry`.
    ///
    /// Replicas persist in `registry` across calls for the lifetime of
    /// a connection. A token absent from the registry starts as an
    /// empty container; a token appearing at several places in the
    /// snapshot has its log applied exactly once.
    pub fn reconstruct(
        &self,
        registry: &mut HashMap<StreamToken, StreamingList>,
    ) -> Result<DataValue> {
        let wire: WireValue = bincode::deserialize(&self.snapshot)?;
        let mut merged = HashSet::new();
        raise(&wire, &self.logs, registry, &mut merged)
    }
}

// ── Lowering / raising ───────────────────────────────────────────

fn lower(value: &mut DataValue, logs: &mut BTreeMap<StreamToken, Vec<ListOp>>) -> WireValue {
    match value {
        DataValue::Null => WireValue::Null,
        DataValue::Bool(b) => WireValue::Bool(*b),
        DataValue::Int(i) => WireValue::Int(*i),
        DataValue::Float(f) => WireValue::Float(*f),
        DataValue::Text(s) => WireValue::Text(s.clone()),
        DataValue::Bytes(b) => WireValue::Bytes(b.clone()),
        DataValue::List(items) => {
            WireValue::List(items.iter_mut().map(|v| lower(v, logs)).collect())
        }
        DataValue::Map(map) => WireValue::Map(
            map.iter_mut()
                .map(|(k, v)| (k.clone(), lower(v, logs)))
                .collect(),
        ),
        DataValue::Stream(list) => {
            let token = list.token();
            let mut log = list.take_log();
            logs.entry(token).or_default().append(&mut log);
            WireValue::Stream(token)
        }
    }
}

fn raise(
    wire: &WireValue,
    logs: &BTreeMap<StreamToken, Vec<ListOp>>,
    registry: &mut HashMap<StreamToken, StreamingList>,
    merged: &mut HashSet<StreamToken>,
) -> Result<DataValue> {
    Ok(match wire {
        WireValue::Null => DataValue::Null,
        WireValue::Bool(b) => DataValue::Bool(*b),
        WireValue::Int(i) => DataValue::Int(*i),
        WireValue::Float(f) => DataValue::Float(*f),
        WireValue::Text(s) => DataValue::Text(s.clone()),
        WireValue::Bytes(b) => DataValue::Bytes(b.clone()),
        WireValue::List(items) => DataValue::List(
            items
                .iter()
                .map(|v| raise(v, logs, registry, merged))
                .collect::<Result<_>>()?,
        ),
        WireValue::Map(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), raise(v, logs, registry, merged)?);
            }
            DataValue::Map(out)
        }
        WireValue::Stream(token) => {
            let replica = registry
                .entry(*token)
                .or_insert_with(|| StreamingList::with_token(*token));
            if merged.insert(*token) {
                if let Some(log) = logs.get(token) {
                    replica.merge(log)?;
                }
            }
            DataValue::Stream(replica.clone())
        }
    })
}
