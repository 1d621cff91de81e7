use std::collections::HashMap;

use chrono::{DateTime, LocalResult, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{f64_to_i64_safe, f64_to_integral};

lazy_static! {
    static ref VERSION_NUMERIC_COMPONENTS_REGEX: Regex =
        Regex::new(r"^\d+(\.\d+)?(\.\d+)?").unwrap();
}

/// A JSON-like value held by a [crate::Context] attribute or listed in a clause.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Stores a string value.
    String(String),
    /// Stores an array of attribute values.
    Array(Vec<AttributeValue>),
    /// Stores a number. The data model does not distinguish integers from floats.
    Number(f64),
    /// Stores a boolean.
    Bool(bool),
    /// Stores a map of attribute values.
    Object(HashMap<String, AttributeValue>),
    /// Stores a null value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        AttributeValue::Array(v.into_iter().map(AttributeValue::from).collect())
    }
}

impl From<&Value> for AttributeValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                Some(float) => AttributeValue::Number(float),
                None => {
                    warn!("could not interpret '{:?}' as f64", n);
                    AttributeValue::String(n.to_string())
                }
            },
            Value::String(s) => AttributeValue::String(s.clone()),
            Value::Array(items) => items.iter().map(AttributeValue::from).collect(),
            Value::Object(obj) => AttributeValue::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), AttributeValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for AttributeValue {
    fn from(v: Value) -> Self {
        AttributeValue::from(&v)
    }
}

impl FromIterator<AttributeValue> for AttributeValue {
    fn from_iter<I: IntoIterator<Item = AttributeValue>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().collect())
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the wrapped value for numbers, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns None unless self is a bool. It will not convert.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Converts either of the following into a UTC timestamp:
    ///  * an RFC3339 string (example: "2016-04-16T17:09:12.759-07:00")
    ///  * a number of milliseconds since the Unix epoch
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Number(millis) => {
                match Utc.timestamp_millis_opt(f64_to_i64_safe(*millis)?) {
                    LocalResult::Single(time) => Some(time),
                    LocalResult::None | LocalResult::Ambiguous(_, _) => None,
                }
            }
            AttributeValue::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            _ => None,
        }
    }

    /// Parses a string value as a semantic version.
    ///
    /// Missing minor and patch components are filled in with zeroes ("2" reads as "2.0.0"), and
    /// build metadata is dropped so that it never affects comparisons.
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?;
        semver::Version::parse(version_str)
            .ok()
            .or_else(|| parse_semver_loose(version_str))
            .map(|mut version| {
                version.build = semver::BuildMetadata::EMPTY;
                version
            })
    }

    /// Returns true if `p` holds for this value, or for any element when this value is an array.
    /// Null never satisfies a predicate.
    pub fn any<P>(&self, mut p: P) -> bool
    where
        P: FnMut(&AttributeValue) -> bool,
    {
        match self {
            AttributeValue::Array(values) => values.iter().any(p),
            AttributeValue::Null => false,
            _ => p(self),
        }
    }

    /// The string form used as hash input when bucketing. Only strings and integral numbers can
    /// be bucketed.
    pub(crate) fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(f) => f64_to_integral(*f).map(|i| i.to_string()),
            _ => None,
        }
    }
}

fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
    let parts = VERSION_NUMERIC_COMPONENTS_REGEX.captures(version_str)?;
    let numeric = parts.get(0)?;

    let mut padded = numeric.as_str().to_string();
    for i in 1..parts.len() {
        if parts.get(i).is_none() {
            padded.push_str(".0");
        }
    }
    padded.push_str(&version_str[numeric.end()..]);

    semver::Version::parse(&padded).ok()
}
