//! The top-level declaration: stats, tag definitions, global defaults,
//! data actions and filter options.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::actions::{deserialize_actions, DataAction};
use crate::error::{DeclarationError, TelemetryResult};
use crate::filter::FilterOptions;
use crate::normalize::TagDefaults;
use crate::property::{compile_property, CompiledProperty};
use crate::tagging::TagCollection;
use crate::types::{CollectionError, Context, Definitions, ErrorStage};

/// Defaults applied to every property that asks for them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalOptions {
    /// Tags injected by `addKeysByTag` when a property declares none.
    #[serde(default)]
    pub add_keys_by_tag: GlobalTags,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GlobalTags {
    #[serde(default)]
    pub tags: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    /// Stat name → raw property, in declaration order.
    #[serde(default)]
    pub stats: Map<String, Value>,
    #[serde(default)]
    pub definitions: Definitions,
    #[serde(default)]
    pub global: GlobalOptions,
    #[serde(default, deserialize_with = "deserialize_actions")]
    pub actions: Vec<DataAction>,
    #[serde(default)]
    pub filter: FilterOptions,
}

impl Declaration {
    pub fn from_value(value: Value) -> Result<Self, DeclarationError> {
        serde_json::from_value(value).map_err(|e| DeclarationError::Invalid(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> Result<Self, DeclarationError> {
        serde_json::from_str(text).map_err(|e| DeclarationError::Invalid(e.to_string()))
    }

    pub fn from_file(path: &Path) -> TelemetryResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DeclarationError::Invalid(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(Self::from_json_str(&text)?)
    }

    pub fn tag_defaults(&self) -> TagDefaults {
        TagDefaults {
            tags: self.global.add_keys_by_tag.tags.clone(),
            definitions: self.definitions.clone(),
        }
    }

    /// Render and compile every property. A property that fails is reported
    /// and left out; the rest still compile.
    pub fn compile(&self, context: &Context) -> (Vec<CompiledProperty>, Vec<CollectionError>) {
        let defaults = Arc::new(self.tag_defaults());
        let mut compiled = Vec::new();
        let mut errors = Vec::new();
        for (name, raw) in &self.stats {
            match compile_property(name, raw, context, &defaults) {
                Ok(Some(property)) => compiled.push(property),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("property '{name}' rejected: {e}");
                    errors.push(CollectionError::new(name.clone(), ErrorStage::Declaration, e));
                }
            }
        }
        (compiled, errors)
    }

    /// Compile against `context` and fail on the first bad property.
    pub fn validate(&self, context: &Context) -> Result<usize, DeclarationError> {
        let defaults = Arc::new(self.tag_defaults());
        let mut enabled = 0;
        for (name, raw) in &self.stats {
            if compile_property(name, raw, context, &defaults)?.is_some() {
                enabled += 1;
            }
        }
        Ok(enabled)
    }
}

/// Tag-eligible collections among `properties`.
pub fn tag_collections<'a>(properties: impl IntoIterator<Item = &'a CompiledProperty>) -> Vec<TagCollection> {
    properties
        .into_iter()
        .filter_map(CompiledProperty::tag_collection)
        .collect()
}
