//! Custom functions callable from a `runFunctions` step.

use serde_json::{Map, Number, Value};

use crate::error::TransformError;
use crate::normalize::steps::{FunctionCall, FunctionName};

type FnResult = Result<Value, String>;

/// Run one declared function over `data`.
pub fn run(call: &FunctionCall, data: Value) -> Result<Value, TransformError> {
    let args = &call.args;
    let result = match call.name {
        FunctionName::FormatMacAddress => format_mac_address(data, args),
        FunctionName::GetPercentFromKeys => get_percent_from_keys(&data, args),
        FunctionName::GetFirstKey => get_first_key(&data, args),
        FunctionName::GetSum => Ok(aggregate(&data, false)),
        FunctionName::GetAverage => Ok(aggregate(&data, true)),
        FunctionName::ParseCsv => parse_csv(&data, args),
        FunctionName::RestructureRules => restructure_rules(data),
    };
    result.map_err(|message| TransformError::Function {
        name: call.name.as_str().to_string(),
        message,
    })
}

fn arg_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integral results stay integers.
fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ── formatMacAddress ─────────────────────────────────────────────────────────

fn format_mac_address(data: Value, args: &Map<String, Value>) -> FnResult {
    match data {
        Value::String(mac) => normalize_mac(&mac).map(Value::String),
        Value::Object(_) => {
            let keys: Vec<String> = match args.get("keys") {
                Some(Value::Array(keys)) => keys
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => vec!["macAddress".to_string()],
            };
            let mut data = data;
            format_mac_fields(&mut data, &keys)?;
            Ok(data)
        }
        other => Err(format!("expected a string or object, got {other}")),
    }
}

fn format_mac_fields(data: &mut Value, keys: &[String]) -> Result<(), String> {
    if let Value::Object(map) = data {
        for (key, value) in map.iter_mut() {
            match value {
                Value::String(mac) if keys.contains(key) => *mac = normalize_mac(mac)?,
                _ => format_mac_fields(value, keys)?,
            }
        }
    }
    Ok(())
}

/// Zero-pad each octet: `0:1:a:ff:2:3` → `00:01:0a:ff:02:03`.
fn normalize_mac(mac: &str) -> Result<String, String> {
    let octets = mac
        .split(':')
        .map(|octet| {
            let valid = (1..=2).contains(&octet.len()) && octet.chars().all(|c| c.is_ascii_hexdigit());
            if valid {
                Ok(format!("{octet:0>2}").to_lowercase())
            } else {
                Err(format!("invalid MAC address '{mac}'"))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    if octets.len() != 6 {
        return Err(format!("invalid MAC address '{mac}'"));
    }
    Ok(octets.join(":"))
}

// ── getPercentFromKeys ───────────────────────────────────────────────────────

fn get_percent_from_keys(data: &Value, args: &Map<String, Value>) -> FnResult {
    let total_key = arg_str(args, "totalKey").ok_or("missing argument 'totalKey'")?;
    let partial_key = arg_str(args, "partialKey").ok_or("missing argument 'partialKey'")?;
    let total = data
        .get(total_key)
        .and_then(number_of)
        .ok_or_else(|| format!("key '{total_key}' is missing or not numeric"))?;
    let partial = data
        .get(partial_key)
        .and_then(number_of)
        .ok_or_else(|| format!("key '{partial_key}' is missing or not numeric"))?;
    if total == 0.0 {
        return Ok(Value::from(0));
    }
    let mut percent = partial / total * 100.0;
    if args.get("inverse").and_then(Value::as_bool).unwrap_or(false) {
        percent = 100.0 - percent;
    }
    Ok(Value::from(percent.round() as i64))
}

// ── getFirstKey ──────────────────────────────────────────────────────────────

fn get_first_key(data: &Value, args: &Map<String, Value>) -> FnResult {
    let first = data
        .as_object()
        .and_then(|map| map.keys().next())
        .ok_or("expected a non-empty object")?;
    let mut key = first.as_str();
    if let Some(split) = arg_str(args, "splitOnValue").filter(|s| !s.is_empty()) {
        key = key.rsplit(split).next().unwrap_or(key);
    }
    let prefix = arg_str(args, "keyPrefix").unwrap_or_default();
    Ok(Value::String(format!("{prefix}{key}")))
}

// ── getSum / getAverage ──────────────────────────────────────────────────────

/// Sum (or average) numeric fields across the child objects of `data`.
/// Non-numeric fields are ignored.
fn aggregate(data: &Value, average: bool) -> Value {
    let mut totals: Vec<(String, f64, usize)> = Vec::new();
    let children = data.as_object().into_iter().flat_map(|m| m.values());
    for child in children.filter_map(Value::as_object) {
        for (key, value) in child {
            let Some(n) = number_of(value) else {
                continue;
            };
            match totals.iter_mut().find(|(k, _, _)| k == key) {
                Some(entry) => {
                    entry.1 += n;
                    entry.2 += 1;
                }
                None => totals.push((key.clone(), n, 1)),
            }
        }
    }
    let mut out = Map::new();
    for (key, sum, count) in totals {
        let value = if average { sum / count as f64 } else { sum };
        out.insert(key, number_value(value));
    }
    Value::Object(out)
}

// ── parseCsv ─────────────────────────────────────────────────────────────────

fn parse_csv(data: &Value, args: &Map<String, Value>) -> FnResult {
    let text = data.as_str().ok_or("expected CSV text")?;
    let delimiter = arg_str(args, "delimiter")
        .and_then(|d| d.chars().next())
        .unwrap_or(',');
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(line) => split_csv_line(line, delimiter),
        None => return Ok(Value::Array(Vec::new())),
    };
    let rows: Vec<Value> = lines
        .map(|line| {
            let mut row = Map::new();
            for (name, field) in header.iter().zip(split_csv_line(line, delimiter)) {
                row.insert(name.clone(), Value::String(field));
            }
            Value::Object(row)
        })
        .collect();

    match arg_str(args, "keyName") {
        Some(key_name) => {
            let mut keyed = Map::new();
            for row in rows {
                let key = row
                    .get(key_name)
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("row missing column '{key_name}'"))?
                    .to_string();
                keyed.insert(key, row);
            }
            Ok(Value::Object(keyed))
        }
        None => Ok(Value::Array(rows)),
    }
}

/// Split one CSV line, honouring double-quoted fields and `""` escapes.
fn split_csv_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delimiter && !quoted => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

// ── restructureRules ─────────────────────────────────────────────────────────

/// Group `rule:EVENT` keyed stats by rule name:
/// `{"/Common/r1:HTTP_REQUEST": {..}}` → `{"/Common/r1": {"events": {"HTTP_REQUEST": {..}}}}`.
fn restructure_rules(data: Value) -> FnResult {
    let Value::Object(map) = data else {
        return Err("expected an object".to_string());
    };
    let mut out = Map::new();
    for (key, stats) in map {
        let Some((rule, event)) = key.rsplit_once(':') else {
            out.insert(key, stats);
            continue;
        };
        let entry = out
            .entry(rule.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(rule_map) = entry else {
            continue;
        };
        let events = rule_map
            .entry("events")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(events) = events {
            events.insert(event.to_string(), stats);
        }
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> FunctionCall {
        serde_json::from_value(json!({"name": name, "args": args})).unwrap()
    }

    #[test]
    fn test_format_mac_address() {
        let out = run(&call("formatMacAddress", json!({})), json!("0:1:A:ff:2:3")).unwrap();
        assert_eq!(out, json!("00:01:0a:ff:02:03"));

        let out = run(
            &call("formatMacAddress", json!({})),
            json!({"eth0": {"macAddress": "a:b:c:d:e:f"}}),
        )
        .unwrap();
        assert_eq!(out["eth0"]["macAddress"], json!("0a:0b:0c:0d:0e:0f"));

        let err = run(&call("formatMacAddress", json!({})), json!("zz:00")).unwrap_err();
        assert!(matches!(err, TransformError::Function { ref name, .. } if name == "formatMacAddress"));
    }

    #[test]
    fn test_get_percent_from_keys() {
        let data = json!({"total": "200", "used": 50});
        let args = json!({"totalKey": "total", "partialKey": "used"});
        assert_eq!(run(&call("getPercentFromKeys", args), data.clone()).unwrap(), json!(25));
        let args = json!({"totalKey": "total", "partialKey": "used", "inverse": true});
        assert_eq!(run(&call("getPercentFromKeys", args), data).unwrap(), json!(75));
        let zero = json!({"total": 0, "used": 0});
        let args = json!({"totalKey": "total", "partialKey": "used"});
        assert_eq!(run(&call("getPercentFromKeys", args), zero).unwrap(), json!(0));
    }

    #[test]
    fn test_get_first_key() {
        let data = json!({"https://localhost/mgmt/tm/sys/clock/0": {}, "other": {}});
        let args = json!({"splitOnValue": "/", "keyPrefix": "clock-"});
        assert_eq!(run(&call("getFirstKey", args), data).unwrap(), json!("clock-0"));
        assert!(run(&call("getFirstKey", json!({})), json!({})).is_err());
    }

    #[test]
    fn test_sum_and_average() {
        let data = json!({"cpu0": {"user": 10, "idle": 90, "name": "cpu0"}, "cpu1": {"user": 30, "idle": 70}});
        assert_eq!(run(&call("getSum", json!({})), data.clone()).unwrap(), json!({"user": 40, "idle": 160}));
        assert_eq!(run(&call("getAverage", json!({})), data).unwrap(), json!({"user": 20, "idle": 80}));
        let uneven = json!({"a": {"x": 1}, "b": {"x": 2}});
        assert_eq!(run(&call("getAverage", json!({})), uneven).unwrap(), json!({"x": 1.5}));
    }

    #[test]
    fn test_parse_csv() {
        let csv = "name,value\n\"vs, one\",1\nvs2,2\n";
        let out = run(&call("parseCsv", json!({})), json!(csv)).unwrap();
        assert_eq!(out, json!([{"name": "vs, one", "value": "1"}, {"name": "vs2", "value": "2"}]));
        let keyed = run(&call("parseCsv", json!({"keyName": "name"})), json!(csv)).unwrap();
        assert_eq!(keyed["vs2"]["value"], json!("2"));
    }

    #[test]
    fn test_restructure_rules() {
        let data = json!({
            "/Common/r1:HTTP_REQUEST": {"executed": 5},
            "/Common/r1:CLIENT_ACCEPTED": {"executed": 2},
            "plain": {"executed": 1}
        });
        let out = run(&call("restructureRules", json!({})), data).unwrap();
        assert_eq!(out["/Common/r1"]["events"]["HTTP_REQUEST"]["executed"], json!(5));
        assert_eq!(out["/Common/r1"]["events"]["CLIENT_ACCEPTED"]["executed"], json!(2));
        assert_eq!(out["plain"], json!({"executed": 1}));
    }
}
