//! Structural reduce: flatten the REST wire shape into plain nested maps.

use serde_json::{Map, Value};

use crate::error::TransformError;
use crate::normalize::steps::{ConvertArrayToMap, IncludeFirstEntry};
use crate::pattern;
use crate::types::KEY_SEP;

/// Single-key wrappers replaced by their inner value.
const WRAPPERS: [&str; 4] = ["nestedStats", "value", "description", "color"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReduceOptions {
    pub convert_array_to_map: Option<ConvertArrayToMap>,
    pub include_first_entry: Option<IncludeFirstEntry>,
}

impl ReduceOptions {
    pub fn with_convert(opts: ConvertArrayToMap) -> Self {
        Self {
            convert_array_to_map: Some(opts),
            include_first_entry: None,
        }
    }

    pub fn with_first_entry(opts: IncludeFirstEntry) -> Self {
        Self {
            convert_array_to_map: None,
            include_first_entry: Some(opts),
        }
    }
}

/// Reduce `data`. Reducing already-reduced data changes nothing.
pub fn reduce(data: Value, opts: &ReduceOptions) -> Result<Value, TransformError> {
    reduce_node(data, opts, true)
}

fn reduce_node(data: Value, opts: &ReduceOptions, top: bool) -> Result<Value, TransformError> {
    match data {
        Value::Object(mut map) => {
            match map.remove("entries") {
                Some(Value::Object(entries)) => return reduce_entries(entries, opts),
                Some(other) => {
                    map.insert("entries".to_string(), other);
                }
                None => {}
            }
            if let Some(convert) = &opts.convert_array_to_map {
                if let Some(Value::Array(items)) = map.get("items") {
                    let items = items.clone();
                    return convert_array_to_map(items, convert, opts);
                }
            }
            if map.len() == 1 {
                let wrapped = map.keys().next().is_some_and(|k| WRAPPERS.contains(&k.as_str()));
                if wrapped {
                    if let Some((_, inner)) = map.into_iter().next() {
                        return reduce_node(inner, opts, false);
                    }
                    return Ok(Value::Object(Map::new()));
                }
            }
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key, reduce_node(value, opts, false)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => match &opts.convert_array_to_map {
            Some(convert) if top => convert_array_to_map(items, convert, opts),
            _ => items
                .into_iter()
                .map(|item| reduce_node(item, opts, false))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        },
        scalar => Ok(scalar),
    }
}

fn reduce_entries(entries: Map<String, Value>, opts: &ReduceOptions) -> Result<Value, TransformError> {
    let mut out = Map::new();
    let mut entries = entries.into_iter().peekable();

    if let Some(first) = &opts.include_first_entry {
        let lift = entries.peek().is_some_and(|(key, _)| {
            pattern::is_match(&first.pattern, key)
                && !first
                    .exclude_pattern
                    .as_deref()
                    .is_some_and(|exclude| pattern::is_match(exclude, key))
        });
        if lift {
            if let Some((key, value)) = entries.next() {
                match reduce_node(value, opts, false)? {
                    Value::Object(inner) => out.extend(inner),
                    other => {
                        out.insert(simplify_key(&key), other);
                    }
                }
            }
        }
    }

    for (key, value) in entries {
        out.insert(simplify_key(&key), reduce_node(value, opts, false)?);
    }
    Ok(Value::Object(out))
}

/// Shorten an entry key: URL keys keep only the segment before `/stats`,
/// and `~Common~vs1` becomes `/Common/vs1`.
pub fn simplify_key(key: &str) -> String {
    let mut short = key;
    if short.contains("://") {
        let trimmed = short.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix("/stats").unwrap_or(trimmed);
        short = trimmed.rsplit('/').next().unwrap_or(trimmed);
    }
    if short.starts_with('~') {
        short.replace('~', "/")
    } else {
        short.to_string()
    }
}

/// Turn an array of objects into a map keyed by each element's `key_name`.
pub fn convert_array_to_map(
    items: Vec<Value>,
    convert: &ConvertArrayToMap,
    opts: &ReduceOptions,
) -> Result<Value, TransformError> {
    if items.iter().any(|item| key_of(item, &convert.key_name).is_none()) {
        if convert.skip_when_key_missing {
            return items
                .into_iter()
                .map(|item| reduce_node(item, opts, false))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }
        return Err(TransformError::MissingArrayKey(convert.key_name.clone()));
    }
    let prefix = convert.key_name_prefix.as_deref().unwrap_or_default();
    let mut out = Map::new();
    for item in items {
        let Some(key) = key_of(&item, &convert.key_name) else {
            continue;
        };
        out.insert(format!("{prefix}{key}"), reduce_node(item, opts, false)?);
    }
    Ok(Value::Object(out))
}

fn key_of(item: &Value, key_name: &str) -> Option<String> {
    match item.get(key_name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Descend into `data` along the `::`-separated `key`.
pub fn get_data_by_key(data: Value, key: &str) -> Result<Value, TransformError> {
    let mut current = data;
    for segment in key.split(KEY_SEP).filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(mut map) => map
                .remove(segment)
                .ok_or_else(|| TransformError::KeyNotFound(key.to_string()))?,
            _ => return Err(TransformError::KeyNotFound(key.to_string())),
        };
    }
    Ok(current)
}
