//! The self-describing value tree published through the data server.
//!
//! A [`DataValue`] replaces the "any serializable object" of dynamic
//! languages with a closed set of variants. Streaming containers embed
//! as [`DataValue::Stream`] nodes and are the only part of the tree
//! transported incrementally.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::streaming::StreamingList;

/// One value in a published data set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<DataValue>),
    Map(BTreeMap<String, DataValue>),
    Stream(StreamingList),
}

impl DataValue {
    /// Look up a key when the value is a map.
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Mutable access to a map entry.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut DataValue> {
        match self {
            DataValue::Map(m) => m.get_mut(key),
            _ => None,
        }
    }

    /// Mutable access to an embedded streaming container.
    pub fn as_stream_mut(&mut self) -> Option<&mut StreamingList> {
        match self {
            DataValue::Stream(sl) => Some(sl),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DataValue::Null => 0,
            DataValue::Bool(_) => 1,
            DataValue::Int(_) => 2,
            DataValue::Float(_) => 3,
            DataValue::Text(_) => 4,
            DataValue::Bytes(_) => 5,
            DataValue::List(_) => 6,
            DataValue::Map(_) => 7,
            DataValue::Stream(_) => 8,
        }
    }

    /// A total order over values, used by [`StreamingList::sort`].
    /// Values of different variants order by variant rank; floats use
    /// `f64::total_cmp`.
    pub(crate) fn total_cmp(&self, other: &DataValue) -> Ordering {
        use DataValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (List(a), List(b)) => seq_cmp(a, b),
            (Map(a), Map(b)) => map_cmp(a, b),
            (Stream(a), Stream(b)) => seq_cmp(a.items(), b.items()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn seq_cmp(a: &[DataValue], b: &[DataValue]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.total_cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

fn map_cmp(a: &BTreeMap<String, DataValue>, b: &BTreeMap<String, DataValue>) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        match ka.cmp(kb) {
            Ordering::Equal => {}
            other => return other,
        }
        match va.total_cmp(vb) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

// ── Conversions ──────────────────────────────────────────────────

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> Self {
        DataValue::Int(v as i64)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}

impl From<StreamingList> for DataValue {
    fn from(v: StreamingList) -> Self {
        DataValue::Stream(v)
    }
}
