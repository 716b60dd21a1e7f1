//! Request parameters: conversion between `google.protobuf.Struct` and JSON,
//! and resolution of executor-specific keys.
//!
//! A key of the form `<executor>__<key>` only reaches `<executor>`, where it
//! arrives as `<key>`. An object stored under the executor's own name is
//! merged into that executor's parameters.

use std::collections::BTreeMap;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};
use serde_json::{Map, Number, Value as Json};

pub const SHARD_KEY: &str = "__shard_key__";
pub const DEADLINE_MS: &str = "deadline_ms";
pub const RESULTS_KEY: &str = "__results__";

const SEPARATOR: &str = "__";

pub fn struct_to_json(s: &Struct) -> Map<String, Json> {
    s.fields
        .iter()
        .map(|(k, v)| (k.clone(), value_to_json(v)))
        .collect()
}

pub fn json_to_struct(map: &Map<String, Json>) -> Struct {
    Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect(),
    }
}

pub fn value_to_json(value: &Value) -> Json {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Json::Null,
        Some(Kind::BoolValue(b)) => Json::Bool(*b),
        Some(Kind::NumberValue(n)) => number_to_json(*n),
        Some(Kind::StringValue(s)) => Json::String(s.clone()),
        Some(Kind::ListValue(list)) => Json::Array(list.values.iter().map(value_to_json).collect()),
        Some(Kind::StructValue(s)) => Json::Object(struct_to_json(s)),
    }
}

pub fn json_to_value(json: &Json) -> Value {
    let kind = match json {
        Json::Null => Kind::NullValue(0),
        Json::Bool(b) => Kind::BoolValue(*b),
        Json::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Json::String(s) => Kind::StringValue(s.clone()),
        Json::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        Json::Object(map) => Kind::StructValue(json_to_struct(map)),
    };
    Value { kind: Some(kind) }
}

// Struct numbers are doubles; integral ones are rendered back as integers so
// `top_k: 10` does not come back as `10.0`.
fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Json::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}

fn split_specific(key: &str) -> Option<(&str, &str)> {
    if key.starts_with(SEPARATOR) {
        return None;
    }
    key.split_once(SEPARATOR)
        .filter(|(executor, rest)| !executor.is_empty() && !rest.is_empty())
}

/// Whether per-executor rewriting is needed at all. When it is not, requests
/// can travel to executors without being touched.
pub fn has_specific_params(params: &Struct, is_executor: impl Fn(&str) -> bool) -> bool {
    params.fields.iter().any(|(key, value)| {
        split_specific(key).is_some()
            || (is_executor(key) && matches!(value.kind, Some(Kind::StructValue(_))))
    })
}

/// The parameters `executor` should see.
pub fn specific_params(params: &Struct, executor: &str) -> Struct {
    let mut fields: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in &params.fields {
        match split_specific(key) {
            Some((target, rest)) => {
                if target == executor {
                    fields.insert(rest.to_string(), value.clone());
                }
            }
            None => {
                fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    if let Some(Value {
        kind: Some(Kind::StructValue(own)),
    }) = params.fields.get(executor)
    {
        for (key, value) in &own.fields {
            fields.insert(key.clone(), value.clone());
        }
    }
    Struct { fields }
}

pub fn get_str<'a>(params: &'a Struct, key: &str) -> Option<&'a str> {
    match params.fields.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s),
        _ => None,
    }
}

pub fn get_number(params: &Struct, key: &str) -> Option<f64> {
    match params.fields.get(key)?.kind.as_ref()? {
        Kind::NumberValue(n) => Some(*n),
        Kind::StringValue(s) => s.parse().ok(),
        _ => None,
    }
}
