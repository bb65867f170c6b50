//! Property rendering: `{{ }}` substitution and `if`/`then`/`else` blocks.
//!
//! Rendering works on a copy of the raw declared property, before it is
//! parsed into a [`PropertyDescriptor`](crate::property::PropertyDescriptor).

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::DeclarationError;
use crate::types::Context;

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("template pattern is valid"))
}

/// Conditional functions usable inside an `if` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditional {
    DeviceVersionGreaterOrEqual,
    IsModuleProvisioned,
    BashDisabled,
}

impl Conditional {
    pub fn from_name(name: &str) -> Result<Self, DeclarationError> {
        match name {
            "deviceVersionGreaterOrEqual" => Ok(Conditional::DeviceVersionGreaterOrEqual),
            "isModuleProvisioned" => Ok(Conditional::IsModuleProvisioned),
            "bashDisabled" => Ok(Conditional::BashDisabled),
            other => Err(DeclarationError::UnknownConditional(other.to_string())),
        }
    }

    pub fn evaluate(self, arg: &Value, context: &Context) -> bool {
        match self {
            Conditional::DeviceVersionGreaterOrEqual => match (context.device_version(), arg.as_str()) {
                (Some(device), Some(wanted)) => compare_versions(device, wanted).is_ge(),
                _ => false,
            },
            Conditional::IsModuleProvisioned => arg
                .as_str()
                .map(|module| context.is_module_provisioned(module))
                .unwrap_or(false),
            Conditional::BashDisabled => context.bash_disabled() == arg.as_bool().unwrap_or(true),
        }
    }
}

/// Dotted version comparison; missing segments count as zero.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord.is_ne() {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// Render a raw property against `context`.
pub fn render(property: &Value, context: &Context) -> Result<Value, DeclarationError> {
    let mut rendered = property.clone();
    substitute(&mut rendered, context);
    resolve_conditionals(&mut rendered, context)?;
    Ok(rendered)
}

/// Replace `{{name}}` placeholders in string values. Unknown names render
/// as the empty string.
pub fn substitute(value: &mut Value, context: &Context) {
    match value {
        Value::String(s) if s.contains("{{") => {
            let replaced = template_re().replace_all(s, |caps: &Captures| {
                match context.lookup(&caps[1]) {
                    Some(Value::String(v)) => v.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                }
            });
            *s = replaced.into_owned();
        }
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, context)),
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, context)),
        _ => {}
    }
}

fn take(map: &mut Map<String, Value>, key: &str) -> Option<Value> {
    let value = map.get(key).cloned();
    map.retain(|k, _| k != key);
    value
}

/// Evaluate every `if` block depth-first. A block's chosen branch is merged
/// into the enclosing object; a non-object branch replaces it.
pub fn resolve_conditionals(value: &mut Value, context: &Context) -> Result<(), DeclarationError> {
    match value {
        Value::Object(map) => {
            let mut replacement = None;
            while let Some(condition) = take(map, "if") {
                let then_branch = take(map, "then");
                let else_branch = take(map, "else");
                let branch = if evaluate(&condition, context)? {
                    then_branch
                } else {
                    else_branch
                };
                match branch {
                    Some(Value::Object(chosen)) => map.extend(chosen),
                    Some(other) if map.is_empty() => {
                        replacement = Some(other);
                        break;
                    }
                    _ => {}
                }
            }
            match replacement {
                Some(mut other) => {
                    resolve_conditionals(&mut other, context)?;
                    *value = other;
                }
                None => {
                    for child in map.values_mut() {
                        resolve_conditionals(child, context)?;
                    }
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter_mut()
            .try_for_each(|item| resolve_conditionals(item, context)),
        _ => Ok(()),
    }
}

/// An `if` block is the AND of its conditional functions.
pub fn evaluate(condition: &Value, context: &Context) -> Result<bool, DeclarationError> {
    let Value::Object(functions) = condition else {
        return Err(DeclarationError::Invalid(format!(
            "'if' block must be an object, got {condition}"
        )));
    };
    let mut outcome = true;
    for (name, arg) in functions {
        let conditional = Conditional::from_name(name)?;
        outcome &= conditional.evaluate(arg, context);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Context {
        Context::from_value(json!({
            "deviceVersion": "14.1.0.3",
            "provisioning": {"asm": {"level": "nominal"}, "apm": {"level": "none"}},
            "bashDisabled": false,
            "tenant": "Common",
            "port": 443
        }))
    }

    #[test]
    fn test_version_compare() {
        use std::cmp::Ordering;
        assert_eq!(compare_versions("14.1.0.3", "14.1"), Ordering::Greater);
        assert_eq!(compare_versions("13.1.0", "14.0"), Ordering::Less);
        assert_eq!(compare_versions("15.0", "15.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_substitution() {
        let out = render(&json!({"key": "ltm/virtual/~{{tenant}}~vs:{{port}}/{{missing}}"}), &context()).unwrap();
        assert_eq!(out, json!({"key": "ltm/virtual/~Common~vs:443/"}));
    }

    #[test]
    fn test_conditional_then_else() {
        let property = json!({
            "key": "base",
            "if": {"deviceVersionGreaterOrEqual": "14.1", "isModuleProvisioned": "asm"},
            "then": {"key": "new"},
            "else": {"key": "old"}
        });
        let out = render(&property, &context()).unwrap();
        assert_eq!(out, json!({"key": "new"}));

        let property = json!({
            "if": {"isModuleProvisioned": "apm"},
            "then": {"key": "apm"},
            "else": {"disabled": true}
        });
        assert_eq!(render(&property, &context()).unwrap(), json!({"disabled": true}));
    }

    #[test]
    fn test_nested_and_chained_conditionals() {
        let property = json!({
            "if": {"bashDisabled": true},
            "then": {"disabled": true},
            "else": {
                "key": "bash",
                "if": {"deviceVersionGreaterOrEqual": "15.0"},
                "then": {"keyArgs": "new"},
                "else": {"keyArgs": "old"}
            },
            "structure": {"parentKey": {"if": {"isModuleProvisioned": "asm"}, "then": "asm", "else": "none"}}
        });
        let out = render(&property, &context()).unwrap();
        assert_eq!(out["key"], json!("bash"));
        assert_eq!(out["keyArgs"], json!("old"));
        assert_eq!(out["structure"]["parentKey"], json!("asm"));
        assert!(out.get("if").is_none());
    }

    #[test]
    fn test_unknown_conditional_rejected() {
        let property = json!({"if": {"isCloudy": true}, "then": {}});
        assert_eq!(
            render(&property, &context()).unwrap_err(),
            DeclarationError::UnknownConditional("isCloudy".to_string())
        );
    }

    #[test]
    fn test_render_leaves_input_untouched() {
        let property = json!({"key": "{{tenant}}"});
        let _ = render(&property, &context()).unwrap();
        assert_eq!(property, json!({"key": "{{tenant}}"}));
    }
}
