//! In-memory model of one profiling run, decoded from a `pstats` dump.

use serde::ser::{SerializeSeq as _, Serializer};
use serde::Serialize;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::{MarshalValue, ParseError, marshal};

/// Call site key: `(file, line, function)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallIdentity {
    pub file: String,
    pub line: i64,
    pub function: String,
}

impl CallIdentity {
    pub fn new(file: impl Into<String>, line: i64, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.into(),
        }
    }
}

impl fmt::Display for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.file, self.line, self.function)
    }
}

/// A numeric field, kept in the representation the dump used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    Int(i64),
    Float(f64),
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

/// Per-caller statistics. `cProfile` writes a 4-tuple
/// `(calls, primitive calls, own time, cumulative time)`; the pure-Python
/// `profile` module writes a bare call count.
#[derive(Debug, Clone, PartialEq)]
pub enum CallerMetrics {
    Detailed([Metric; 4]),
    Count(Metric),
}

impl Serialize for CallerMetrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Detailed(fields) => {
                let mut seq = serializer.serialize_seq(Some(fields.len()))?;
                for field in fields {
                    seq.serialize_element(field)?;
                }
                seq.end()
            }
            Self::Count(count) => count.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallMetrics {
    pub primitive_calls: Metric,
    pub total_calls: Metric,
    pub own_time: Metric,
    pub cumulative_time: Metric,
    pub callers: Vec<(CallIdentity, CallerMetrics)>,
}

impl CallMetrics {
    pub fn scalars(&self) -> [Metric; 4] {
        [
            self.primitive_calls,
            self.total_calls,
            self.own_time,
            self.cumulative_time,
        ]
    }
}

/// All statistics of one profiling run, in the order the dump listed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileReport {
    entries: Vec<(CallIdentity, CallMetrics)>,
}

impl ProfileReport {
    /// Builds a report; a repeated call site replaces the earlier entry.
    pub fn new(entries: Vec<(CallIdentity, CallMetrics)>) -> Self {
        let mut keyed = KeyedEntries::with_capacity(entries.len());
        for (identity, metrics) in entries {
            keyed.insert(identity, metrics);
        }
        Self {
            entries: keyed.into_vec(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ParseError> {
        Self::from_marshal(marshal::from_path(path)?)
    }

    pub fn from_marshal(value: MarshalValue) -> Result<Self, ParseError> {
        let MarshalValue::Dict(raw) = value else {
            return Err(ParseError::Shape(format!(
                "expected a dict at top level, found {}",
                value.kind()
            )));
        };

        let mut entries = KeyedEntries::with_capacity(raw.len());
        for (key, value) in raw {
            let identity = decode_identity(&key)?;
            let metrics = decode_metrics(&identity, value)?;
            entries.insert(identity, metrics);
        }
        Ok(Self {
            entries: entries.into_vec(),
        })
    }

    pub fn entries(&self) -> &[(CallIdentity, CallMetrics)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_identity(key: &MarshalValue) -> Result<CallIdentity, ParseError> {
    let shape_err = || {
        ParseError::Shape(format!(
            "call site key must be (file, line, function), found {key:?}"
        ))
    };
    let MarshalValue::Tuple(fields) = key else {
        return Err(shape_err());
    };
    let [file, line, function] = fields.as_slice() else {
        return Err(shape_err());
    };
    let (Some(file), MarshalValue::Int(line), Some(function)) =
        (file.as_text(), line, function.as_text())
    else {
        return Err(shape_err());
    };
    Ok(CallIdentity::new(file, *line, function))
}

fn decode_metric(owner: &CallIdentity, value: &MarshalValue) -> Result<Metric, ParseError> {
    match value {
        MarshalValue::Int(v) => Ok(Metric::Int(*v)),
        MarshalValue::Float(v) => Ok(Metric::Float(*v)),
        other => Err(ParseError::Shape(format!(
            "{owner}: expected a number, found {}",
            other.kind()
        ))),
    }
}

fn decode_metrics(identity: &CallIdentity, value: MarshalValue) -> Result<CallMetrics, ParseError> {
    let MarshalValue::Tuple(mut fields) = value else {
        return Err(ParseError::Shape(format!(
            "{identity}: expected a 5-tuple of statistics, found {}",
            value.kind()
        )));
    };
    if fields.len() != 5 {
        return Err(ParseError::Shape(format!(
            "{identity}: expected 5 statistics fields, found {}",
            fields.len()
        )));
    }

    let callers = match fields.pop() {
        Some(MarshalValue::Dict(raw)) => decode_callers(identity, raw)?,
        other => {
            return Err(ParseError::Shape(format!(
                "{identity}: callers must be a dict, found {}",
                other.as_ref().map_or("nothing", MarshalValue::kind)
            )));
        }
    };

    Ok(CallMetrics {
        primitive_calls: decode_metric(identity, &fields[0])?,
        total_calls: decode_metric(identity, &fields[1])?,
        own_time: decode_metric(identity, &fields[2])?,
        cumulative_time: decode_metric(identity, &fields[3])?,
        callers,
    })
}

fn decode_callers(
    identity: &CallIdentity,
    raw: Vec<(MarshalValue, MarshalValue)>,
) -> Result<Vec<(CallIdentity, CallerMetrics)>, ParseError> {
    let mut callers = KeyedEntries::with_capacity(raw.len());
    for (key, value) in raw {
        let caller = decode_identity(&key)?;
        let metrics = match &value {
            MarshalValue::Tuple(fields) if fields.len() == 4 => CallerMetrics::Detailed([
                decode_metric(identity, &fields[0])?,
                decode_metric(identity, &fields[1])?,
                decode_metric(identity, &fields[2])?,
                decode_metric(identity, &fields[3])?,
            ]),
            MarshalValue::Int(_) | MarshalValue::Float(_) => {
                CallerMetrics::Count(decode_metric(identity, &value)?)
            }
            other => {
                return Err(ParseError::Shape(format!(
                    "{identity}: caller {caller} has malformed statistics ({})",
                    other.kind()
                )));
            }
        };
        callers.insert(caller, metrics);
    }
    Ok(callers.into_vec())
}

/// Dict-like accumulator: a repeated key keeps its first position and takes
/// the last value.
struct KeyedEntries<V> {
    items: Vec<(CallIdentity, V)>,
    index: HashMap<CallIdentity, usize>,
}

impl<V> KeyedEntries<V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn insert(&mut self, key: CallIdentity, value: V) {
        match self.index.get(&key) {
            Some(&slot) => self.items[slot].1 = value,
            None => {
                self.index.insert(key.clone(), self.items.len());
                self.items.push((key, value));
            }
        }
    }

    fn into_vec(self) -> Vec<(CallIdentity, V)> {
        self.items
    }
}
