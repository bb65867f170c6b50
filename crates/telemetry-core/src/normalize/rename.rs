//! Key renaming at every depth.

use serde_json::{Map, Value};

use crate::normalize::steps::{PatternMap, RenameKeys, RenameRule};
use crate::pattern;

/// Rename keys throughout `data`. Pattern maps run in order; within one map
/// the first trigger that fires decides the new key.
pub fn rename_keys(data: Value, rename: &RenameKeys) -> Value {
    match data {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let value = rename_keys(value, rename);
                let key = rename
                    .patterns
                    .0
                    .iter()
                    .fold(key, |key, map| rename_key(key, map, rename.options.exact_match));
                out.insert(key, value);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(|v| rename_keys(v, rename)).collect()),
        other => other,
    }
}

fn rename_key(key: String, map: &PatternMap, exact_match: bool) -> String {
    for (trigger, rule) in map {
        let exact = rule.exact_match().unwrap_or(exact_match);
        let fired = if exact {
            key == *trigger
        } else {
            key.contains(trigger.as_str())
        };
        if !fired {
            continue;
        }
        return match rule {
            RenameRule::Constant { constant, .. } | RenameRule::Shorthand(constant) => constant.clone(),
            RenameRule::Character {
                replace_character,
                with_character,
                ..
            } => key.replace(replace_character.as_str(), with_character),
            RenameRule::Capture { pattern, group, .. } => {
                pattern::capture(pattern, &key, *group).unwrap_or(key)
            }
        };
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rename(value: Value) -> RenameKeys {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rename_at_every_depth() {
        let data = json!({"tmm0": {"cpu.user": 1, "items": [{"cpu.idle": 2}]}});
        let rules = rename(json!({"patterns": [
            {"tmm": {"constant": "tmmCpu"}},
            {".": {"replaceCharacter": ".", "withCharacter": "_"}}
        ]}));
        let out = rename_keys(data, &rules);
        assert_eq!(out, json!({"tmmCpu": {"cpu_user": 1, "items": [{"cpu_idle": 2}]}}));
    }

    #[test]
    fn test_first_match_wins_within_map() {
        let rules = rename(json!({"patterns": {"vs": "first", "vs1": "second"}}));
        let out = rename_keys(json!({"vs1": 1}), &rules);
        assert_eq!(out, json!({"first": 1}));
    }

    #[test]
    fn test_exact_match_global_and_override() {
        let rules = rename(json!({
            "patterns": {"name": {"constant": "n"}, "bits": {"constant": "b", "exactMatch": false}},
            "options": {"exactMatch": true}
        }));
        let out = rename_keys(json!({"hostname": 1, "name": 2, "bitsIn": 3}), &rules);
        assert_eq!(out, json!({"hostname": 1, "n": 2, "b": 3}));
    }

    #[test]
    fn test_capture_rule() {
        let rules = rename(json!({"patterns": {"cpu": {"pattern": "cpu(\\d+)", "group": 1}}}));
        let out = rename_keys(json!({"cpu12": 5, "cpux": 1}), &rules);
        assert_eq!(out, json!({"12": 5, "cpux": 1}));
    }
}
