use flowcore::{EnvEntry, NodeConfig};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

static ENV_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\((\S+)\)$").expect("env token pattern is valid"));

/// Name inside an exact `$(NAME)` token, if `s` is one.
pub fn token_name(s: &str) -> Option<&str> {
    ENV_TOKEN
        .captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Substitute whole-value `$(NAME)` tokens anywhere inside `value`.
///
/// Only strings that are exactly one token are replaced; unknown names
/// keep the literal token.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    match value {
        Value::String(s) => token_name(s)
            .and_then(lookup)
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, lookup)).collect()),
        Value::Object(map) => Value::Object(resolve_properties(map, lookup)),
        other => other.clone(),
    }
}

pub fn resolve_properties<F>(properties: &Map<String, Value>, lookup: &F) -> Map<String, Value>
where
    F: Fn(&str) -> Option<Value>,
{
    properties
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, lookup)))
        .collect()
}

/// Resolved copy of `node`. The `env` definitions of usage nodes are left
/// as declared since they are evaluated separately.
pub fn resolve_node<F>(node: &NodeConfig, lookup: &F) -> NodeConfig
where
    F: Fn(&str) -> Option<Value>,
{
    let mut resolved = node.clone();
    resolved.properties = node
        .properties
        .iter()
        .map(|(k, v)| {
            if k == "env" {
                (k.clone(), v.clone())
            } else {
                (k.clone(), resolve_value(v, lookup))
            }
        })
        .collect();
    resolved
}

/// Evaluate typed `env` definitions into concrete values.
///
/// Entries of type `env` name another variable, looked up in `parent`.
/// Later entries override earlier ones with the same name.
pub fn evaluate_env<F>(entries: &[EnvEntry], parent: F) -> HashMap<String, Value>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut values = HashMap::with_capacity(entries.len());
    for entry in entries {
        let value = match entry.kind.as_str() {
            "num" => to_number(&entry.value).unwrap_or_else(|| {
                tracing::warn!("env {}: not a number: {}", entry.name, entry.value);
                Value::Null
            }),
            "bool" => Value::Bool(match &entry.value {
                Value::Bool(b) => *b,
                Value::String(s) => s == "true",
                _ => false,
            }),
            "json" => match &entry.value {
                Value::String(s) => serde_json::from_str(s).unwrap_or_else(|e| {
                    tracing::warn!("env {}: invalid json: {}", entry.name, e);
                    entry.value.clone()
                }),
                other => other.clone(),
            },
            "env" => entry
                .value
                .as_str()
                .and_then(|name| parent(name))
                .unwrap_or(Value::Null),
            _ => match &entry.value {
                Value::String(_) => entry.value.clone(),
                Value::Null => Value::String(String::new()),
                other => Value::String(other.to_string()),
            },
        };
        values.insert(entry.name.clone(), value);
    }
    values
}

fn to_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(Value::Number(i.into()))
            } else {
                s.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
            }
        }
        _ => None,
    }
}
