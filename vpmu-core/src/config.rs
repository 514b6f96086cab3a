//! Structured configuration accepted by a `Stream` (§6, §7.3).
//!
//! This module deliberately does not parse any on-disk format (TOML, YAML,
//! ...) — that is peripheral per the spec's non-goals. It only defines the
//! shape a stream expects once some caller has already turned a document
//! into JSON values.

use serde::Deserialize;
use serde_json::Value;

/// One simulator's configuration: a name used to look it up in the
/// stream-kind's factory, plus a free-form bag of model-specific
/// parameters (`frequency`, `dual_issue`, `levels`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: std::collections::BTreeMap<String, Value>,
}

impl SimConfig {
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.params.get(key).cloned().and_then(|v| serde_json::from_value(v).ok())
    }
}

/// A stream's configuration document: either a single simulator or an
/// array of them (§6, "A structured document per stream (array or object)").
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StreamConfig {
    One(SimConfig),
    Many(Vec<SimConfig>),
}

impl StreamConfig {
    pub fn entries(&self) -> Vec<SimConfig> {
        match self {
            StreamConfig::One(c) => vec![c.clone()],
            StreamConfig::Many(cs) => cs.clone(),
        }
    }
}

impl From<SimConfig> for StreamConfig {
    fn from(c: SimConfig) -> Self {
        StreamConfig::One(c)
    }
}

impl From<Vec<SimConfig>> for StreamConfig {
    fn from(cs: Vec<SimConfig>) -> Self {
        StreamConfig::Many(cs)
    }
}
