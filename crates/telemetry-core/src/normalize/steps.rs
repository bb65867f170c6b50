//! Declared normalization steps and their options.
//!
//! Every step is a single-key JSON object naming the variant, e.g.
//! `{"filterKeys": {"exclude": ["kind"]}}`. Malformed steps are rejected
//! while the declaration is deserialized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DeclarationError;
use crate::types::Definitions;

/// One stage of an explicit normalization list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NormalizationStep {
    FilterKeys(FilterKeys),
    RenameKeys(RenameKeys),
    FormatTimestamps(Vec<String>),
    AddKeysByTag(AddKeysByTagStep),
    RunFunctions(Vec<FunctionCall>),
    ConvertArrayToMap(ConvertArrayToMap),
    IncludeFirstEntry(IncludeFirstEntry),
}

impl NormalizationStep {
    /// Steps that need the structural reduce to run with their options.
    pub fn requires_reduce(&self) -> bool {
        matches!(
            self,
            NormalizationStep::ConvertArrayToMap(_) | NormalizationStep::IncludeFirstEntry(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NormalizationStep::FilterKeys(_) => "filterKeys",
            NormalizationStep::RenameKeys(_) => "renameKeys",
            NormalizationStep::FormatTimestamps(_) => "formatTimestamps",
            NormalizationStep::AddKeysByTag(_) => "addKeysByTag",
            NormalizationStep::RunFunctions(_) => "runFunctions",
            NormalizationStep::ConvertArrayToMap(_) => "convertArrayToMap",
            NormalizationStep::IncludeFirstEntry(_) => "includeFirstEntry",
        }
    }
}

// ── filterKeys ───────────────────────────────────────────────────────────────

/// Keep or drop keys by name or pattern. Exactly one mode may be given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFilterKeys", into = "RawFilterKeys")]
pub enum FilterKeys {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawFilterKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude: Option<Vec<String>>,
}

impl TryFrom<RawFilterKeys> for FilterKeys {
    type Error = DeclarationError;

    fn try_from(raw: RawFilterKeys) -> Result<Self, Self::Error> {
        match (raw.include, raw.exclude) {
            (Some(_), Some(_)) => Err(DeclarationError::InvalidFilter(
                "include and exclude are mutually exclusive".to_string(),
            )),
            (Some(include), None) => Ok(FilterKeys::Include(include)),
            (None, Some(exclude)) => Ok(FilterKeys::Exclude(exclude)),
            (None, None) => Err(DeclarationError::InvalidFilter(
                "one of include or exclude is required".to_string(),
            )),
        }
    }
}

impl From<FilterKeys> for RawFilterKeys {
    fn from(filter: FilterKeys) -> Self {
        match filter {
            FilterKeys::Include(include) => RawFilterKeys {
                include: Some(include),
                exclude: None,
            },
            FilterKeys::Exclude(exclude) => RawFilterKeys {
                include: None,
                exclude: Some(exclude),
            },
        }
    }
}

// ── renameKeys ───────────────────────────────────────────────────────────────

/// How one matched key is rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenameRule {
    Constant {
        constant: String,
        #[serde(rename = "exactMatch", default, skip_serializing_if = "Option::is_none")]
        exact_match: Option<bool>,
    },
    Character {
        #[serde(rename = "replaceCharacter")]
        replace_character: String,
        #[serde(rename = "withCharacter")]
        with_character: String,
        #[serde(rename = "exactMatch", default, skip_serializing_if = "Option::is_none")]
        exact_match: Option<bool>,
    },
    Capture {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<usize>,
        #[serde(rename = "exactMatch", default, skip_serializing_if = "Option::is_none")]
        exact_match: Option<bool>,
    },
    /// A bare string is shorthand for a constant replacement.
    Shorthand(String),
}

impl RenameRule {
    pub fn exact_match(&self) -> Option<bool> {
        match self {
            RenameRule::Constant { exact_match, .. }
            | RenameRule::Character { exact_match, .. }
            | RenameRule::Capture { exact_match, .. } => *exact_match,
            RenameRule::Shorthand(_) => None,
        }
    }
}

/// An ordered map of trigger → rule.
pub type PatternMap = Vec<(String, RenameRule)>;

/// Ordered list of pattern maps; accepts a single object or an array of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct PatternMaps(pub Vec<PatternMap>);

impl TryFrom<Value> for PatternMaps {
    type Error = DeclarationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let maps = match value {
            Value::Object(map) => vec![parse_pattern_map(map)?],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => parse_pattern_map(map),
                    other => Err(DeclarationError::Invalid(format!(
                        "renameKeys pattern map must be an object, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(DeclarationError::Invalid(format!(
                    "renameKeys patterns must be an object or array, got {other}"
                )))
            }
        };
        Ok(PatternMaps(maps))
    }
}

fn parse_pattern_map(map: Map<String, Value>) -> Result<PatternMap, DeclarationError> {
    map.into_iter()
        .map(|(trigger, rule)| {
            serde_json::from_value::<RenameRule>(rule)
                .map(|rule| (trigger.clone(), rule))
                .map_err(|e| {
                    DeclarationError::Invalid(format!("renameKeys rule '{trigger}': {e}"))
                })
        })
        .collect()
}

impl From<PatternMaps> for Value {
    fn from(maps: PatternMaps) -> Self {
        let to_object = |map: PatternMap| {
            let mut out = Map::new();
            for (trigger, rule) in map {
                out.insert(trigger, serde_json::to_value(rule).unwrap_or(Value::Null));
            }
            Value::Object(out)
        };
        Value::Array(maps.0.into_iter().map(to_object).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameOptions {
    #[serde(default)]
    pub exact_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameKeys {
    pub patterns: PatternMaps,
    #[serde(default)]
    pub options: RenameOptions,
}

// ── addKeysByTag ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagOptions {
    /// Keys that are neither tagged nor descended into.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip: Vec<String>,
    /// Sibling field used as the match subject instead of the item's key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classify_by_keys: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddKeysByTag {
    /// Tag name → constant, definition name, or `{pattern, group}`.
    /// Absent means the declaration's global tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions: Option<Definitions>,
    #[serde(default)]
    pub opts: TagOptions,
}

/// `addKeysByTag: true` uses the global tags; an object overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddKeysByTagStep {
    Enabled(bool),
    Options(AddKeysByTag),
}

impl AddKeysByTagStep {
    pub fn options(&self) -> Option<AddKeysByTag> {
        match self {
            AddKeysByTagStep::Enabled(true) => Some(AddKeysByTag::default()),
            AddKeysByTagStep::Enabled(false) => None,
            AddKeysByTagStep::Options(opts) => Some(opts.clone()),
        }
    }
}

// ── structural reduce options ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertArrayToMap {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name_prefix: Option<String>,
    /// Leave the array untouched instead of failing when an element lacks
    /// `key_name`.
    #[serde(default)]
    pub skip_when_key_missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeFirstEntry {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_pattern: Option<String>,
}

// ── runFunctions ─────────────────────────────────────────────────────────────

/// The fixed library of custom functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FunctionName {
    FormatMacAddress,
    GetPercentFromKeys,
    GetFirstKey,
    GetSum,
    GetAverage,
    ParseCsv,
    RestructureRules,
}

impl FunctionName {
    pub const ALL: [FunctionName; 7] = [
        FunctionName::FormatMacAddress,
        FunctionName::GetPercentFromKeys,
        FunctionName::GetFirstKey,
        FunctionName::GetSum,
        FunctionName::GetAverage,
        FunctionName::ParseCsv,
        FunctionName::RestructureRules,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionName::FormatMacAddress => "formatMacAddress",
            FunctionName::GetPercentFromKeys => "getPercentFromKeys",
            FunctionName::GetFirstKey => "getFirstKey",
            FunctionName::GetSum => "getSum",
            FunctionName::GetAverage => "getAverage",
            FunctionName::ParseCsv => "parseCsv",
            FunctionName::RestructureRules => "restructureRules",
        }
    }
}

impl TryFrom<String> for FunctionName {
    type Error = DeclarationError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        FunctionName::ALL
            .into_iter()
            .find(|f| f.as_str() == name)
            .ok_or(DeclarationError::UnknownFunction(name))
    }
}

impl From<FunctionName> for String {
    fn from(name: FunctionName) -> Self {
        name.as_str().to_string()
    }
}

impl std::fmt::Display for FunctionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: FunctionName,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}
