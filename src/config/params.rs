// src/config/params.rs

//! Run parameters from a JSON file and `--set KEY=VALUE` overrides.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::errors::{MarketdagError, Result};

/// Merge the parameters file (if any) with `overrides`, later entries
/// winning. Override values are parsed as JSON when possible and kept as
/// strings otherwise.
pub fn load_parameters(path: Option<&Path>, overrides: &[(String, String)]) -> Result<Value> {
    let mut params = match path {
        Some(path) => {
            let contents = fs::read_to_string(path)?;
            match serde_json::from_str::<Value>(&contents)? {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(MarketdagError::Validation(format!(
                        "parameters file {} must hold a JSON object, found {}",
                        path.display(),
                        json_kind(&other)
                    )));
                }
            }
        }
        None => Map::new(),
    };

    for (key, raw) in overrides {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        params.insert(key.clone(), value);
    }

    Ok(Value::Object(params))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
