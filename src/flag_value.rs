use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::f64_to_i64_safe;

/// The value a flag serves for one of its variations.
///
/// Variations decode to the narrowest variant that holds them: whole numbers become `Int`,
/// other numbers `Float`, and null, arrays and objects stay as raw `Json`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Str(String),
    Int(i64),
    Float(f64),
    Json(Value),
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> FlagValue {
        FlagValue::Bool(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> FlagValue {
        FlagValue::Str(value.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> FlagValue {
        FlagValue::Str(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> FlagValue {
        FlagValue::Int(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> FlagValue {
        FlagValue::Float(value)
    }
}

impl From<Value> for FlagValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => FlagValue::Bool(b),
            Value::String(s) => FlagValue::Str(s),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => FlagValue::Int(i),
                (None, Some(f)) => FlagValue::Float(f),
                (None, None) => {
                    warn!("flag value {} does not fit a number type; keeping it as a string", n);
                    FlagValue::Json(Value::String(n.to_string()))
                }
            },
            other => FlagValue::Json(other),
        }
    }
}

impl FlagValue {
    /// The value as a bool, or `None` for any other variant.
    pub fn as_bool(&self) -> Option<bool> {
        if let FlagValue::Bool(b) = self {
            return Some(*b);
        }
        self.log_mismatch("bool");
        None
    }

    /// The value as an owned string, or `None` for any other variant.
    pub fn as_string(&self) -> Option<String> {
        if let FlagValue::Str(s) = self {
            return Some(s.clone());
        }
        self.log_mismatch("string");
        None
    }

    /// Either number variant widened to a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(f) => Some(*f),
            FlagValue::Int(i) => Some(*i as f64),
            _ => {
                self.log_mismatch("number");
                None
            }
        }
    }

    /// Either number variant as an integer. Floats are truncated toward zero and must lie
    /// within the range a double represents exactly.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            FlagValue::Float(f) => f64_to_i64_safe(*f),
            _ => None,
        }
    }

    /// The value as JSON. Never fails.
    pub fn as_json(&self) -> Value {
        match self {
            FlagValue::Bool(b) => Value::Bool(*b),
            FlagValue::Str(s) => Value::String(s.clone()),
            FlagValue::Int(i) => Value::from(*i),
            FlagValue::Float(f) => Value::from(*f),
            FlagValue::Json(v) => v.clone(),
        }
    }

    fn log_mismatch(&self, wanted: &str) {
        warn!("flag value {:?} is not a {}", self, wanted);
    }
}
