//! Transcoding of profile reports into the JSON document the viewer loads.
//!
//! JSON object keys must be strings, while a report is keyed by
//! `(file, line, function)` on two levels: the entries themselves and each
//! entry's callers. Both levels are flattened with the same [`KeyStyle`].

use serde::ser::{SerializeMap as _, SerializeTuple as _, Serializer};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::path::Path;

use crate::{
    BridgeError, BridgeResult, CallIdentity, CallMetrics, CallerMetrics, ProfileReport,
};

/// How call site keys are flattened into JSON object keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStyle {
    /// `file,line,function`, the layout the viewer splits on.
    #[default]
    Joined,
    /// The JSON text of `[file, line, function]`; unambiguous for any name.
    Array,
}

impl KeyStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Array => "array",
        }
    }
}

impl clap::ValueEnum for KeyStyle {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Joined, Self::Array]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

pub fn flatten_key(identity: &CallIdentity, style: KeyStyle) -> String {
    match style {
        KeyStyle::Joined => format!("{},{},{}", identity.file, identity.line, identity.function),
        KeyStyle::Array => {
            serde_json::json!([identity.file, identity.line, identity.function]).to_string()
        }
    }
}

/// Recovers a call site from a flattened key.
///
/// For [`KeyStyle::Joined`] the rightmost `,<integer>,` segment is taken as
/// the line number, so file names containing commas still round-trip.
pub fn unflatten_key(key: &str, style: KeyStyle) -> Option<CallIdentity> {
    match style {
        KeyStyle::Joined => {
            let commas: Vec<usize> = key.match_indices(',').map(|(i, _)| i).collect();
            commas.windows(2).rev().find_map(|pair| {
                let (before, after) = (pair[0], pair[1]);
                let line = key[before + 1..after].parse::<i64>().ok()?;
                Some(CallIdentity::new(&key[..before], line, &key[after + 1..]))
            })
        }
        KeyStyle::Array => serde_json::from_str::<(String, i64, String)>(key)
            .ok()
            .map(|(file, line, function)| CallIdentity::new(file, line, function)),
    }
}

/// Converts stored `pstats` reports into viewer JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsCodec {
    key_style: KeyStyle,
}

impl StatsCodec {
    pub fn new(key_style: KeyStyle) -> Self {
        Self { key_style }
    }

    /// Loads the report at `report_path` and returns its JSON form.
    pub fn encode(&self, report_path: &Path) -> BridgeResult<String> {
        let report = ProfileReport::load(report_path)?;
        self.encode_report(&report)
    }

    pub fn encode_report(&self, report: &ProfileReport) -> BridgeResult<String> {
        let mut seen = HashMap::with_capacity(report.len());
        let mut entries = Vec::with_capacity(report.len());
        for (identity, metrics) in report.entries() {
            let key = self.unique_key(&mut seen, identity)?;

            let mut seen_callers = HashMap::with_capacity(metrics.callers.len());
            let mut callers = Vec::with_capacity(metrics.callers.len());
            for (caller, caller_metrics) in &metrics.callers {
                callers.push((self.unique_key(&mut seen_callers, caller)?, caller_metrics));
            }

            entries.push((key, EncodedMetrics { metrics, callers }));
        }
        Ok(serde_json::to_string(&Keyed(&entries))?)
    }

    fn unique_key<'a>(
        &self,
        seen: &mut HashMap<String, &'a CallIdentity>,
        identity: &'a CallIdentity,
    ) -> BridgeResult<String> {
        let key = flatten_key(identity, self.key_style);
        if let Some(previous) = seen.insert(key.clone(), identity)
            && previous != identity
        {
            return Err(BridgeError::KeyCollision {
                key,
                first: previous.to_string(),
                second: identity.to_string(),
            });
        }
        Ok(key)
    }
}

/// Reads `report_path` and returns viewer JSON with the default key style.
pub fn stats_to_json(report_path: &Path) -> BridgeResult<String> {
    StatsCodec::default().encode(report_path)
}

/// Serializes `(key, value)` pairs as a JSON object, preserving order.
struct Keyed<'a, T>(&'a [(String, T)]);

impl<T: Serialize> Serialize for Keyed<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct EncodedMetrics<'a> {
    metrics: &'a CallMetrics,
    callers: Vec<(String, &'a CallerMetrics)>,
}

impl Serialize for EncodedMetrics<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(5)?;
        for scalar in self.metrics.scalars() {
            tuple.serialize_element(&scalar)?;
        }
        tuple.serialize_element(&Keyed(&self.callers))?;
        tuple.end()
    }
}
