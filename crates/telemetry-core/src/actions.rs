//! User-declared data actions: conditional tagging and data inclusion or
//! exclusion, applied to collected output in declaration order.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::DeclarationError;
use crate::matcher::{get_matches, preserve_strict_matches, remove_strict_matches};
use crate::pattern;
use crate::tagging::{apply_set_tag, TagScope};
use crate::types::Definitions;

/// When an action applies.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Every branch of the tree must be satisfied.
    All(Value),
    /// At least one of the trees must be satisfied.
    Any(Vec<Value>),
}

impl Condition {
    /// The match trees making up this condition.
    pub fn trees(&self) -> Vec<&Value> {
        match self {
            Condition::All(tree) => vec![tree],
            Condition::Any(trees) => trees.iter().collect(),
        }
    }

    pub fn evaluate(&self, data: &Value) -> bool {
        match self {
            Condition::All(tree) => all_match(data, tree),
            Condition::Any(trees) => trees.iter().any(|tree| all_match(data, tree)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    SetTag {
        tags: Map<String, Value>,
        locations: Option<Value>,
    },
    IncludeData {
        locations: Value,
    },
    ExcludeData {
        locations: Value,
    },
}

/// A validated data action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataAction", into = "RawDataAction")]
pub struct DataAction {
    pub enable: bool,
    pub condition: Option<Condition>,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataAction {
    #[serde(default = "default_enable")]
    enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    if_all_match: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    if_any_match: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set_tag: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    include_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locations: Option<Value>,
}

fn default_enable() -> bool {
    true
}

impl TryFrom<RawDataAction> for DataAction {
    type Error = String;

    fn try_from(raw: RawDataAction) -> Result<Self, Self::Error> {
        let condition = match (raw.if_all_match, raw.if_any_match) {
            (Some(_), Some(_)) => {
                return Err("ifAllMatch and ifAnyMatch are mutually exclusive".to_string())
            }
            (Some(tree), None) => {
                if !tree.is_object() {
                    return Err("ifAllMatch must be an object".to_string());
                }
                Some(Condition::All(tree))
            }
            (None, Some(trees)) => {
                if trees.iter().any(|t| !t.is_object()) {
                    return Err("ifAnyMatch must be an array of objects".to_string());
                }
                Some(Condition::Any(trees))
            }
            (None, None) => None,
        };

        let locations = match raw.locations {
            Some(Value::Object(map)) => Some(Value::Object(map)),
            Some(other) => return Err(format!("locations must be an object, got {other}")),
            None => None,
        };

        let kind = match (raw.set_tag, raw.include_data, raw.exclude_data) {
            (Some(tags), None, None) => ActionKind::SetTag { tags, locations },
            (None, Some(_), None) => ActionKind::IncludeData {
                locations: locations.ok_or("includeData requires locations")?,
            },
            (None, None, Some(_)) => ActionKind::ExcludeData {
                locations: locations.ok_or("excludeData requires locations")?,
            },
            (None, None, None) => {
                return Err("one of setTag, includeData or excludeData is required".to_string())
            }
            _ => {
                return Err("setTag, includeData and excludeData are mutually exclusive".to_string())
            }
        };

        Ok(DataAction {
            enable: raw.enable,
            condition,
            kind,
        })
    }
}

impl From<DataAction> for RawDataAction {
    fn from(action: DataAction) -> Self {
        let mut raw = RawDataAction {
            enable: action.enable,
            ..Default::default()
        };
        match action.condition {
            Some(Condition::All(tree)) => raw.if_all_match = Some(tree),
            Some(Condition::Any(trees)) => raw.if_any_match = Some(trees),
            None => {}
        }
        match action.kind {
            ActionKind::SetTag { tags, locations } => {
                raw.set_tag = Some(tags);
                raw.locations = locations;
            }
            ActionKind::IncludeData { locations } => {
                raw.include_data = Some(Value::Object(Map::new()));
                raw.locations = Some(locations);
            }
            ActionKind::ExcludeData { locations } => {
                raw.exclude_data = Some(Value::Object(Map::new()));
                raw.locations = Some(locations);
            }
        }
        raw
    }
}

/// Validate a list of raw actions, reporting the index of the first bad one.
pub fn parse_actions(values: &[Value]) -> Result<Vec<DataAction>, DeclarationError> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value(value.clone())
                .map_err(|e| DeclarationError::InvalidAction {
                    index,
                    message: e.to_string(),
                })
        })
        .collect()
}

/// `deserialize_with` helper that keeps the failing action's index.
pub(crate) fn deserialize_actions<'de, D>(deserializer: D) -> Result<Vec<DataAction>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    parse_actions(&values).map_err(serde::de::Error::custom)
}

fn all_match(data: &Value, tree: &Value) -> bool {
    let Value::Object(tree) = tree else {
        return false;
    };
    tree.iter().all(|(key, expected)| {
        get_matches(data, key, true)
            .into_iter()
            .filter_map(|k| data.get(&k))
            .any(|actual| match expected {
                Value::Object(_) => all_match(actual, expected),
                _ => value_matches(actual, expected),
            })
    })
}

/// Compare a data value with a condition leaf. Equal values match; a string
/// leaf is also tried as a regex against the value's text.
fn value_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    let Value::String(re) = expected else {
        return false;
    };
    match actual {
        Value::String(s) => pattern::is_match(re, s),
        Value::Number(n) => pattern::is_match(re, &n.to_string()),
        Value::Bool(b) => pattern::is_match(re, &b.to_string()),
        _ => false,
    }
}

/// Run `actions` over collected output in order.
pub fn process_actions(
    data: &mut Value,
    actions: &[DataAction],
    scope: &TagScope,
    definitions: &Definitions,
) {
    for (index, action) in actions.iter().enumerate() {
        if !action.enable {
            continue;
        }
        if let Some(condition) = &action.condition {
            if !condition.evaluate(data) {
                tracing::debug!("data action #{index} skipped: condition not met");
                continue;
            }
        }
        match &action.kind {
            ActionKind::SetTag { tags, locations } => {
                apply_set_tag(data, tags, locations.as_ref(), scope, definitions);
            }
            ActionKind::IncludeData { locations } => {
                preserve_strict_matches(data, locations, true, &mut |_: &str, _: &Value| true);
            }
            ActionKind::ExcludeData { locations } => {
                let removed = remove_strict_matches(data, locations, &mut |_: &str, _: &Value| true);
                tracing::debug!("data action #{index} removed {removed} entries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(value: Value) -> DataAction {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> Value {
        json!({
            "system": {"hostname": "bigip1.example.com", "version": "15.1.0"},
            "virtualServers": {
                "/Common/vs1": {"enabledState": "enabled", "bits": 10},
                "/Common/vs2": {"enabledState": "disabled", "bits": 0}
            },
            "pools": {"/Common/p1": {"members": 2}}
        })
    }

    #[test]
    fn test_parse_validation() {
        assert!(parse_actions(&[json!({"setTag": {"a": "b"}})]).is_ok());
        let err = parse_actions(&[
            json!({"setTag": {"a": "b"}}),
            json!({"includeData": {}}),
        ])
        .unwrap_err();
        assert!(matches!(err, DeclarationError::InvalidAction { index: 1, .. }));
        assert!(parse_actions(&[json!({"enable": true})]).is_err());
        assert!(parse_actions(&[json!({
            "excludeData": {}, "locations": {"a": true},
            "ifAllMatch": {}, "ifAnyMatch": [{}]
        })])
        .is_err());
    }

    #[test]
    fn test_enable_defaults_true() {
        let a = action(json!({"setTag": {"x": "y"}}));
        assert!(a.enable);
        assert!(a.condition.is_none());
    }

    #[test]
    fn test_condition_regex_and_equality() {
        let data = sample();
        assert!(Condition::All(json!({"system": {"hostname": "^bigip1"}})).evaluate(&data));
        assert!(Condition::All(json!({"virtualServers": {"vs1$": {"bits": 10}}})).evaluate(&data));
        assert!(!Condition::All(json!({"system": {"hostname": "^bigip2"}})).evaluate(&data));
        assert!(!Condition::All(json!({"system": {"missing": "x"}})).evaluate(&data));
        assert!(Condition::Any(vec![
            json!({"system": {"version": "^14"}}),
            json!({"system": {"version": "^15"}})
        ])
        .evaluate(&data));
        // invalid regex is treated as no match
        assert!(!Condition::All(json!({"system": {"hostname": "([bad"}})).evaluate(&data));
    }

    #[test]
    fn test_exclude_and_include_data() {
        let mut data = sample();
        let actions = vec![action(json!({
            "excludeData": {},
            "locations": {"virtualServers": {"vs2$": true}}
        }))];
        process_actions(&mut data, &actions, &TagScope::Poller(Vec::new()), &Definitions::new());
        assert!(data["virtualServers"].get("/Common/vs2").is_none());
        assert!(data["virtualServers"].get("/Common/vs1").is_some());

        let actions = vec![action(json!({
            "includeData": {},
            "locations": {"system": {"hostname": true}}
        }))];
        process_actions(&mut data, &actions, &TagScope::Poller(Vec::new()), &Definitions::new());
        assert_eq!(data, json!({"system": {"hostname": "bigip1.example.com"}}));
    }

    #[test]
    fn test_disabled_and_unmet_actions_skipped() {
        let mut data = sample();
        let actions = vec![
            action(json!({"enable": false, "excludeData": {}, "locations": {"system": true}})),
            action(json!({
                "ifAllMatch": {"system": {"hostname": "nomatch"}},
                "excludeData": {},
                "locations": {"pools": true}
            })),
        ];
        process_actions(&mut data, &actions, &TagScope::Poller(Vec::new()), &Definitions::new());
        assert_eq!(data, sample());
    }

    #[test]
    fn test_conditional_set_tag() {
        let mut data = sample();
        let actions = vec![action(json!({
            "ifAnyMatch": [{"system": {"version": "^15"}}],
            "setTag": {"upgraded": true},
            "locations": {"system": true}
        }))];
        process_actions(&mut data, &actions, &TagScope::Poller(Vec::new()), &Definitions::new());
        assert_eq!(data["system"]["upgraded"], json!(true));
    }

    #[test]
    fn test_serialize_round_trips_shape() {
        let a = action(json!({"excludeData": {}, "locations": {"a": true}}));
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["locations"], json!({"a": true}));
        assert_eq!(value["excludeData"], json!({}));
        assert_eq!(value["enable"], json!(true));
    }
}
