//! Core data types shared across the collection engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separator between the endpoint and the nested child path of a property key.
pub const KEY_SEP: &str = "::";

/// Device facts consumed by the property renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(pub Map<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a context from a JSON object. Non-objects yield an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Resolve a dotted path (`provisioning.ltm.level`) against the context.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn device_version(&self) -> Option<&str> {
        self.0.get("deviceVersion").and_then(Value::as_str)
    }

    /// A module counts as provisioned when it is listed with a level other
    /// than `none`.
    pub fn is_module_provisioned(&self, module: &str) -> bool {
        let Some(entry) = self.0.get("provisioning").and_then(|p| p.get(module)) else {
            return false;
        };
        match entry.get("level").and_then(Value::as_str) {
            Some(level) => level != "none",
            None => entry.as_str().map(|level| level != "none").unwrap_or(false),
        }
    }

    pub fn bash_disabled(&self) -> bool {
        self.0
            .get("bashDisabled")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A symbolic tag definition: a regex and the capture group to extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

impl TagDefinition {
    pub fn new(pattern: impl Into<String>, group: Option<usize>) -> Self {
        Self {
            pattern: pattern.into(),
            group,
        }
    }

    /// Group to extract. An explicit `0` and an absent group are the same.
    pub fn group_index(&self) -> usize {
        self.group.unwrap_or(0)
    }
}

/// Symbolic name → definition table used when resolving tags.
pub type Definitions = HashMap<String, TagDefinition>;

/// Which stage a collection error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Declaration,
    Fetch,
    Transform,
    Scheduling,
}

/// One failed property within a collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionError {
    pub property: String,
    pub stage: ErrorStage,
    pub message: String,
}

impl CollectionError {
    pub fn new(property: impl Into<String>, stage: ErrorStage, message: impl ToString) -> Self {
        Self {
            property: property.into(),
            stage,
            message: message.to_string(),
        }
    }
}

/// Result of one collection cycle: best-effort stats plus per-property errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionOutput {
    pub stats: Map<String, Value>,
    pub errors: Vec<CollectionError>,
}

impl CollectionOutput {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_for(&self, property: &str) -> Option<&CollectionError> {
        self.errors.iter().find(|e| e.property == property)
    }
}
