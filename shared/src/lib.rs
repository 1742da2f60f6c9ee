use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use strum_macros::{Display, EnumString};

pub const DEFAULT_THRESHOLD: f32 = 0.1;
pub const DEFAULT_LIMIT: usize = 50;

/// Tag scores in ranking order. Serializes as a JSON object whose keys keep
/// that order, so the highest scoring tag is always the first key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMap(Vec<(String, f32)>);

impl TagMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, tag: impl Into<String>, score: f32) {
        self.0.push((tag.into(), score));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, tag: &str) -> Option<f32> {
        self.0
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, score)| *score)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(tag, score)| (tag.as_str(), *score))
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(tag, _)| tag.as_str())
    }
}

impl FromIterator<(String, f32)> for TagMap {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for TagMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (tag, score) in &self.0 {
            map.serialize_entry(tag, score)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TagMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagMapVisitor;

        impl<'de> Visitor<'de> for TagMapVisitor {
            type Value = TagMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping tags to scores")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<TagMap, A::Error> {
                let mut tags = TagMap::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((tag, score)) = access.next_entry::<String, f32>()? {
                    tags.push(tag, score);
                }
                Ok(tags)
            }
        }

        deserializer.deserialize_map(TagMapVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub filename: String,
    pub tags: TagMap,
}

/// One line of input to the inference worker.
///
/// `threshold` and `limit` stay raw JSON here: numbers and numeric strings are
/// both accepted, and the receiver validates them. Absent or `null` means the
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
}

/// One line of output from the inference worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    Success { id: Value, predictions: Vec<Prediction> },
    Failure { id: Value, error: String },
}

impl WorkerResponse {
    pub fn id(&self) -> &Value {
        match self {
            WorkerResponse::Success { id, .. } | WorkerResponse::Failure { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PoolMode {
    AcceleratorPool,
    SingleReplicaFallback,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Html,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub mode: PoolMode,
    pub replicas: usize,
}
