use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::attribute_reference::Reference;
use crate::error::ContextError;
use crate::AttributeValue;

/// Kind names the type of entity a [Context] describes, such as "user" or "organization".
///
/// A valid kind is non-empty, is made of ASCII letters, digits, `.`, `_` and `-`, and is neither
/// "kind" nor "multi".
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    pub fn user() -> Self {
        Self(Cow::Borrowed("user"))
    }

    pub(crate) fn multi() -> Self {
        Self(Cow::Borrowed("multi"))
    }

    pub fn is_user(&self) -> bool {
        self == "user"
    }

    pub fn is_multi(&self) -> bool {
        self == "multi"
    }
}

impl AsRef<str> for Kind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Ord for Kind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(other.as_ref())
    }
}

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<&str> for Kind {
    fn eq(&self, other: &&str) -> bool {
        self.as_ref() == *other
    }
}

impl PartialEq<str> for Kind {
    fn eq(&self, other: &str) -> bool {
        self.as_ref() == other
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl TryFrom<&str> for Kind {
    type Error = ContextError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let reason = match value {
            "user" => return Ok(Kind::user()),
            "" => "kind cannot be empty",
            "kind" => "\"kind\" is reserved",
            "multi" => "\"multi\" is reserved for multi-contexts",
            k if !k
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')) =>
            {
                "kind contains disallowed characters"
            }
            _ => return Ok(Kind(Cow::Owned(value.to_owned()))),
        };
        Err(ContextError::InvalidKind {
            kind: value.to_owned(),
            reason,
        })
    }
}

impl TryFrom<String> for Kind {
    type Error = ContextError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Kind::try_from(value.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Serialize for Kind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Kind::try_from(s).map_err(D::Error::custom)
    }
}

/// Context is the entity a flag is evaluated for: a single kind with its key and attributes, or a
/// multi-context holding one single-kind context per kind.
///
/// Build one with [crate::ContextBuilder] or [crate::MultiContextBuilder].
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    pub(super) kind: Kind,
    // Empty for a multi-context.
    pub(super) key: String,
    pub(super) name: Option<String>,
    pub(super) anonymous: bool,
    pub(super) attributes: HashMap<String, AttributeValue>,
    // Only present for a multi-context, sorted by kind.
    pub(super) contexts: Option<Vec<Context>>,
}

impl Context {
    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The context's key; empty for a multi-context. Use [Context::as_kind] to reach the key of
    /// one kind inside a multi-context.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Returns the single-kind context of the given kind, if present.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        match &self.contexts {
            Some(contexts) => contexts.iter().find(|c| c.kind() == kind),
            None => (self.kind == *kind).then_some(self),
        }
    }

    /// Every kind present in this context.
    pub fn kinds(&self) -> Vec<&Kind> {
        match &self.contexts {
            Some(contexts) => contexts.iter().map(Context::kind).collect(),
            None => vec![&self.kind],
        }
    }

    /// Looks up an attribute, or a value nested inside an object attribute, by reference.
    ///
    /// The built-in attributes "kind", "key", "name" and "anonymous" are addressable alongside
    /// custom ones. A multi-context only exposes "kind", whose value is "multi".
    pub fn get_value(&self, reference: &Reference) -> Option<AttributeValue> {
        let first = reference.component(0)?;

        if self.is_multi() {
            if reference.depth() == 1 && first == "kind" {
                return Some(AttributeValue::String(self.kind.to_string()));
            }
            warn!("multi-contexts only support retrieving the 'kind' attribute");
            return None;
        }

        let mut value = self.top_level_value(first)?;
        for i in 1..reference.depth() {
            let name = reference.component(i)?;
            value = match value {
                AttributeValue::Object(mut map) => map.remove(name)?,
                _ => return None,
            };
        }
        Some(value)
    }

    fn top_level_value(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "kind" => Some(AttributeValue::String(self.kind.to_string())),
            "key" => Some(AttributeValue::String(self.key.clone())),
            "name" => self.name.clone().map(AttributeValue::String),
            "anonymous" => Some(AttributeValue::Bool(self.anonymous)),
            _ => self.attributes.get(name).cloned(),
        }
    }
}
