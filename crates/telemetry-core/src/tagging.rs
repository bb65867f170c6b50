//! Tag resolution and injection.
//!
//! A tag value is one of:
//! - a literal constant, copied as is;
//! - the name of a symbolic [`TagDefinition`](crate::types::TagDefinition),
//!   resolved by matching its pattern against the item's subject;
//! - an inline `{"pattern": ..., "group": ...}` object, resolved the same way;
//! - a nested object of any of the above.
//!
//! A tag whose pattern does not match is left out. The subject of an item is
//! its key, or the value of its `classify_by_keys` field when one is set.

use serde_json::{Map, Value};

use crate::matcher::{get_deep_matches, node_at_mut};
use crate::normalize::steps::TagOptions;
use crate::pattern;
use crate::types::Definitions;

/// Resolve a single tag value for `subject`. `None` means the tag does not
/// apply and must not be written.
pub fn resolve_tag_value(value: &Value, subject: &str, definitions: &Definitions) -> Option<Value> {
    match value {
        Value::String(name) => match definitions.get(name) {
            Some(def) => pattern::capture(&def.pattern, subject, Some(def.group_index())).map(Value::String),
            None => Some(value.clone()),
        },
        Value::Object(map) if is_inline_pattern(map) => {
            let re = map.get("pattern").and_then(Value::as_str)?;
            let group = map
                .get("group")
                .and_then(Value::as_u64)
                .map(|g| g as usize);
            pattern::capture(re, subject, group).map(Value::String)
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, inner) in map {
                if let Some(v) = resolve_tag_value(inner, subject, definitions) {
                    resolved.insert(key.clone(), v);
                }
            }
            Some(Value::Object(resolved))
        }
        other => Some(other.clone()),
    }
}

fn is_inline_pattern(map: &Map<String, Value>) -> bool {
    map.get("pattern").is_some_and(Value::is_string)
        && map.keys().all(|k| k == "pattern" || k == "group")
}

/// The subject used to resolve tags for `item` stored under `key`.
pub fn subject_for<'a>(key: &'a str, item: &'a Value, classify_by_keys: Option<&str>) -> &'a str {
    classify_by_keys
        .and_then(|field| item.get(field))
        .and_then(Value::as_str)
        .unwrap_or(key)
}

/// Write resolved `tags` into `item`. With `overwrite` unset, keys already
/// present in the item are left alone.
pub fn apply_tags(
    item: &mut Value,
    tags: &Map<String, Value>,
    subject: &str,
    definitions: &Definitions,
    overwrite: bool,
) {
    let Value::Object(target) = item else {
        return;
    };
    for (name, value) in tags {
        if !overwrite && target.contains_key(name) {
            continue;
        }
        if let Some(resolved) = resolve_tag_value(value, subject, definitions) {
            target.insert(name.clone(), resolved);
        }
    }
}

/// Tag every nested object of `data` (except `opts.skip` keys) and recurse.
///
/// Existing keys are never replaced and tag names are not descended into, so
/// running this twice yields the same result as running it once.
pub fn add_keys_by_tag(
    data: &mut Value,
    tags: &Map<String, Value>,
    definitions: &Definitions,
    opts: &TagOptions,
) {
    let Value::Object(map) = data else {
        return;
    };
    for (key, item) in map.iter_mut() {
        if !item.is_object() || opts.skip.iter().any(|s| s == key) || tags.contains_key(key) {
            continue;
        }
        add_keys_by_tag(item, tags, definitions, opts);
        let subject = subject_for(key, item, opts.classify_by_keys.as_deref()).to_string();
        apply_tags(item, tags, &subject, definitions, false);
    }
}

/// A tag-eligible collection inside poller output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCollection {
    /// Path of the collection from the output root.
    pub path: Vec<String>,
    pub classify_by_keys: Option<String>,
}

/// What kind of payload `setTag` is being applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagScope {
    /// Poller output; default targets are its tag-eligible collections.
    Poller(Vec<TagCollection>),
    /// A single event; the default target is the whole payload and the
    /// subject is read from `subject_field`.
    Event { subject_field: Option<String> },
}

impl TagScope {
    pub fn event() -> Self {
        TagScope::Event {
            subject_field: Some("virtual_name".to_string()),
        }
    }
}

/// Apply a user-declared `setTag` action.
///
/// Without `locations` the tags go to the scope's default targets. With
/// `locations` they go to every object addressed by its terminals. Declared
/// tags replace existing keys.
pub fn apply_set_tag(
    data: &mut Value,
    tags: &Map<String, Value>,
    locations: Option<&Value>,
    scope: &TagScope,
    definitions: &Definitions,
) {
    let locations = locations.filter(|l| l.as_object().is_some_and(|m| !m.is_empty()));
    match (locations, scope) {
        (Some(locations), _) => {
            for m in get_deep_matches(&*data, locations) {
                let classify = classify_for_path(scope, &m.path);
                let Some(item) = node_at_mut(data, &m.full_path()) else {
                    continue;
                };
                let subject = subject_for(&m.key, item, classify.as_deref()).to_string();
                apply_tags(item, tags, &subject, definitions, true);
            }
        }
        (None, TagScope::Event { subject_field }) => {
            let subject = subject_field
                .as_deref()
                .and_then(|field| data.get(field))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            apply_tags(data, tags, &subject, definitions, true);
        }
        (None, TagScope::Poller(collections)) => {
            for collection in collections {
                let Some(Value::Object(items)) = node_at_mut(data, &collection.path) else {
                    continue;
                };
                for (key, item) in items.iter_mut() {
                    if !item.is_object() {
                        continue;
                    }
                    let subject =
                        subject_for(key, item, collection.classify_by_keys.as_deref()).to_string();
                    apply_tags(item, tags, &subject, definitions, true);
                }
            }
        }
    }
}

fn classify_for_path(scope: &TagScope, path: &[String]) -> Option<String> {
    match scope {
        TagScope::Poller(collections) => collections
            .iter()
            .find(|c| path.starts_with(&c.path))
            .and_then(|c| c.classify_by_keys.clone()),
        TagScope::Event { .. } => None,
    }
}
