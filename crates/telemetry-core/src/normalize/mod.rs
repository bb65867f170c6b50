//! Normalization pipeline: raw endpoint response → clean stat value.
//!
//! A property either declares an explicit list of steps, run strictly in
//! order, or relies on the default sequence:
//! reduce → key lookup → filterKeys → renameKeys → formatTimestamps → addKeysByTag.

pub mod functions;
pub mod reduce;
pub mod rename;
pub mod steps;
pub mod timestamps;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::TransformError;
use crate::pattern;
use crate::tagging;
use crate::types::Definitions;

pub use reduce::{get_data_by_key, reduce, ReduceOptions};
pub use steps::{
    AddKeysByTag, AddKeysByTagStep, ConvertArrayToMap, FilterKeys, FunctionCall, FunctionName,
    IncludeFirstEntry, NormalizationStep, RenameKeys, RenameRule, TagOptions,
};

/// Declaration-wide defaults for tagging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagDefaults {
    pub tags: Map<String, Value>,
    pub definitions: Definitions,
}

/// The implicit sequence used when no explicit step list is declared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultStages {
    pub reduce: ReduceOptions,
    pub filter_keys: Option<FilterKeys>,
    pub rename_keys: Option<RenameKeys>,
    pub format_timestamps: Option<Vec<String>>,
    pub add_keys_by_tag: Option<AddKeysByTag>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stages {
    Default(DefaultStages),
    Steps(Vec<NormalizationStep>),
}

/// Everything needed to normalize one property's response.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Child path below the endpoint response, if any.
    pub key: Option<String>,
    pub stages: Stages,
    pub tag_defaults: Arc<TagDefaults>,
}

impl Pipeline {
    pub fn new(key: Option<String>, stages: Stages, tag_defaults: Arc<TagDefaults>) -> Self {
        Self {
            key,
            stages,
            tag_defaults,
        }
    }

    /// A pipeline running the default sequence with nothing configured.
    pub fn plain(key: Option<String>) -> Self {
        Self::new(key, Stages::Default(DefaultStages::default()), Arc::default())
    }
}

/// Run `pipeline` over a raw response.
pub fn normalize(raw: Value, pipeline: &Pipeline) -> Result<Value, TransformError> {
    match &pipeline.stages {
        Stages::Default(stages) => run_default(raw, stages, pipeline),
        Stages::Steps(steps) => run_steps(raw, steps, pipeline),
    }
}

fn lookup(data: Value, key: Option<&str>) -> Result<Value, TransformError> {
    match key {
        Some(key) => get_data_by_key(data, key),
        None => Ok(data),
    }
}

fn run_default(raw: Value, stages: &DefaultStages, pipeline: &Pipeline) -> Result<Value, TransformError> {
    let data = reduce(raw, &stages.reduce)?;
    let mut data = lookup(data, pipeline.key.as_deref())?;
    if let Some(filter) = &stages.filter_keys {
        filter_keys(&mut data, filter);
    }
    if let Some(rename) = &stages.rename_keys {
        data = rename::rename_keys(data, rename);
    }
    if let Some(keys) = &stages.format_timestamps {
        timestamps::format_timestamps(&mut data, keys);
    }
    if let Some(tagging) = &stages.add_keys_by_tag {
        add_keys_by_tag(&mut data, tagging, &pipeline.tag_defaults);
    }
    Ok(data)
}

/// Explicit steps, run in order on the unreduced response. The reduce and
/// key lookup happen at the first step that needs structural options, or
/// after the last step when none does.
fn run_steps(raw: Value, steps: &[NormalizationStep], pipeline: &Pipeline) -> Result<Value, TransformError> {
    let key = pipeline.key.as_deref();
    let mut reduced = false;
    let mut data = raw;

    for step in steps {
        data = apply_step(data, step, pipeline)?;
        if !reduced && step.requires_reduce() {
            data = lookup(data, key)?;
            reduced = true;
        }
    }
    if !reduced {
        data = lookup(reduce(data, &ReduceOptions::default())?, key)?;
    }
    Ok(data)
}

fn apply_step(mut data: Value, step: &NormalizationStep, pipeline: &Pipeline) -> Result<Value, TransformError> {
    match step {
        NormalizationStep::FilterKeys(filter) => filter_keys(&mut data, filter),
        NormalizationStep::RenameKeys(rename) => data = rename::rename_keys(data, rename),
        NormalizationStep::FormatTimestamps(keys) => timestamps::format_timestamps(&mut data, keys),
        NormalizationStep::AddKeysByTag(step) => {
            if let Some(opts) = step.options() {
                add_keys_by_tag(&mut data, &opts, &pipeline.tag_defaults);
            }
        }
        NormalizationStep::RunFunctions(calls) => {
            for call in calls {
                data = functions::run(call, data)?;
            }
        }
        NormalizationStep::ConvertArrayToMap(opts) => {
            data = reduce(data, &ReduceOptions::with_convert(opts.clone()))?;
        }
        NormalizationStep::IncludeFirstEntry(opts) => {
            data = reduce(data, &ReduceOptions::with_first_entry(opts.clone()))?;
        }
    }
    Ok(data)
}

fn add_keys_by_tag(data: &mut Value, opts: &AddKeysByTag, defaults: &TagDefaults) {
    let tags = opts.tags.as_ref().unwrap_or(&defaults.tags);
    match &opts.definitions {
        Some(own) => {
            let mut definitions = defaults.definitions.clone();
            definitions.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
            tagging::add_keys_by_tag(data, tags, &definitions, &opts.opts);
        }
        None => tagging::add_keys_by_tag(data, tags, &defaults.definitions, &opts.opts),
    }
}

/// Keep (include) or drop (exclude) keys equal to, or matching, the listed
/// names. Include applies to the top level; exclude applies at every depth.
pub fn filter_keys(data: &mut Value, filter: &FilterKeys) {
    let matches = |names: &[String], key: &str| names.iter().any(|n| n == key || pattern::is_match(n, key));
    match filter {
        FilterKeys::Include(names) => {
            if let Value::Object(map) = data {
                map.retain(|key, _| matches(names, key.as_str()));
            }
        }
        FilterKeys::Exclude(names) => exclude_keys(data, names, &matches),
    }
}

fn exclude_keys(data: &mut Value, names: &[String], matches: &dyn Fn(&[String], &str) -> bool) {
    match data {
        Value::Object(map) => {
            map.retain(|key, _| !matches(names, key.as_str()));
            for value in map.values_mut() {
                exclude_keys(value, names, matches);
            }
        }
        Value::Array(items) => {
            for item in items {
                exclude_keys(item, names, matches);
            }
        }
        _ => {}
    }
}

/// Parse one event line into a flat map.
///
/// JSON objects are taken as they are. Otherwise the line is read as
/// comma-separated `key=value` pairs with optional double quotes; a line with
/// no pairs is kept under `data`.
pub fn event(raw: &str) -> Value {
    let line = raw.trim();
    if line.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(line) {
            return value;
        }
    }
    let mut map = Map::new();
    for field in split_pairs(line) {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    if map.is_empty() {
        map.insert("data".to_string(), Value::String(line.to_string()));
    }
    Value::Object(map)
}

fn split_pairs(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                out.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&line[start..]);
    out
}
