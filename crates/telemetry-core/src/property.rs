//! Declared properties and their compiled, ready-to-run form.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeclarationError;
use crate::normalize::{
    AddKeysByTag, ConvertArrayToMap, DefaultStages, FilterKeys, IncludeFirstEntry,
    NormalizationStep, Pipeline, ReduceOptions, RenameKeys, Stages, TagDefaults, TagOptions,
};
use crate::render::render;
use crate::tagging::TagCollection;
use crate::types::{Context, KEY_SEP};

/// Where a property's result lands in the output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    /// The parent is a folder partition that can be switched off as a whole.
    #[serde(default)]
    pub folder: bool,
}

/// A rendered property, as declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    /// `endpoint` or `endpoint::child::path`.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<Vec<NormalizationStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
    #[serde(default)]
    pub disabled: bool,
    /// Custom endpoints still produce an empty placeholder on failure.
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_args: Option<Value>,
    #[serde(default)]
    pub add_keys_by_tag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classify_by_keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_keys: Option<FilterKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_keys: Option<RenameKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_timestamps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_array_to_map: Option<ConvertArrayToMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_first_entry: Option<IncludeFirstEntry>,
}

impl PropertyDescriptor {
    pub fn endpoint(&self) -> &str {
        self.key.split(KEY_SEP).next().unwrap_or(&self.key)
    }

    /// Path below the endpoint response, if the key names one.
    pub fn child_key(&self) -> Option<&str> {
        self.key
            .split_once(KEY_SEP)
            .map(|(_, child)| child)
            .filter(|child| !child.is_empty())
    }

    /// Whether the property's items receive tags.
    pub fn is_tag_eligible(&self) -> bool {
        self.add_keys_by_tag
            || self.normalization.as_ref().is_some_and(|steps| {
                steps.iter().any(|step| match step {
                    NormalizationStep::AddKeysByTag(step) => step.options().is_some(),
                    _ => false,
                })
            })
    }

    fn stages(&self) -> Stages {
        match &self.normalization {
            Some(steps) => Stages::Steps(steps.clone()),
            None => Stages::Default(DefaultStages {
                reduce: ReduceOptions {
                    convert_array_to_map: self.convert_array_to_map.clone(),
                    include_first_entry: self.include_first_entry.clone(),
                },
                filter_keys: self.filter_keys.clone(),
                rename_keys: self.rename_keys.clone(),
                format_timestamps: self.format_timestamps.clone(),
                add_keys_by_tag: self.add_keys_by_tag.then(|| AddKeysByTag {
                    tags: None,
                    definitions: None,
                    opts: TagOptions {
                        skip: Vec::new(),
                        classify_by_keys: self.classify_by_keys.clone(),
                    },
                }),
            }),
        }
    }
}

/// A property ready to be scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProperty {
    /// Stat name the result is stored under.
    pub name: String,
    pub descriptor: PropertyDescriptor,
    pub pipeline: Pipeline,
}

impl CompiledProperty {
    pub fn new(name: impl Into<String>, descriptor: PropertyDescriptor, tag_defaults: Arc<TagDefaults>) -> Self {
        let pipeline = Pipeline::new(
            descriptor.child_key().map(str::to_string),
            descriptor.stages(),
            tag_defaults,
        );
        Self {
            name: name.into(),
            descriptor,
            pipeline,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.descriptor.endpoint()
    }

    pub fn parent_key(&self) -> Option<&str> {
        self.descriptor
            .structure
            .as_ref()
            .and_then(|s| s.parent_key.as_deref())
    }

    pub fn is_folder(&self) -> bool {
        self.descriptor.structure.as_ref().is_some_and(|s| s.folder)
    }

    pub fn is_custom(&self) -> bool {
        self.descriptor.is_custom
    }

    /// Path of the result from the output root.
    pub fn output_path(&self) -> Vec<String> {
        match self.parent_key() {
            Some(parent) => vec![parent.to_string(), self.name.clone()],
            None => vec![self.name.clone()],
        }
    }

    pub fn tag_collection(&self) -> Option<TagCollection> {
        self.descriptor.is_tag_eligible().then(|| TagCollection {
            path: self.output_path(),
            classify_by_keys: self.descriptor.classify_by_keys.clone(),
        })
    }
}

/// Render and parse one raw property. Disabled properties yield `None`.
pub fn compile_property(
    name: &str,
    raw: &Value,
    context: &Context,
    tag_defaults: &Arc<TagDefaults>,
) -> Result<Option<CompiledProperty>, DeclarationError> {
    let rendered = render(raw, context)?;
    let descriptor: PropertyDescriptor =
        serde_json::from_value(rendered).map_err(|e| DeclarationError::InvalidProperty {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    if descriptor.disabled {
        tracing::debug!("property '{name}' disabled for this device");
        return Ok(None);
    }
    if descriptor.endpoint().is_empty() {
        return Err(DeclarationError::InvalidProperty {
            name: name.to_string(),
            message: "key must name an endpoint".to_string(),
        });
    }
    Ok(Some(CompiledProperty::new(name, descriptor, tag_defaults.clone())))
}
