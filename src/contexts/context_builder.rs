use std::collections::HashMap;

use itertools::Itertools;
use log::warn;

use super::context::{Context, Kind};
use crate::error::ContextError;
use crate::AttributeValue;

const DEFAULT_MULTI_BUILDER_CAPACITY: usize = 3;

/// Builds a single-kind [Context].
///
/// Unless changed, the context's kind is "user", it is not anonymous, and it has no attributes
/// besides its key.
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
}

impl ContextBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            kind: "user".to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    /// Sets the context's kind. An invalid kind is reported by [ContextBuilder::build].
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.key = key.into();
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(&mut self, value: bool) -> &mut Self {
        self.anonymous = value;
        self
    }

    pub fn set_bool(&mut self, attribute_name: &str, value: bool) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::Bool(value))
    }

    pub fn set_float(&mut self, attribute_name: &str, value: f64) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::Number(value))
    }

    pub fn set_string(&mut self, attribute_name: &str, value: impl Into<String>) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::String(value.into()))
    }

    /// Sets any attribute. See [ContextBuilder::try_set_value] for the rules on built-in names.
    pub fn set_value(&mut self, attribute_name: &str, value: AttributeValue) -> &mut Self {
        self.try_set_value(attribute_name, value);
        self
    }

    /// Sets any attribute, returning false if the value was rejected.
    ///
    /// "kind", "key" and "name" only accept strings and "anonymous" only accepts a boolean.
    /// Setting a custom attribute to null removes it.
    pub fn try_set_value(&mut self, attribute_name: &str, value: AttributeValue) -> bool {
        match (attribute_name, value) {
            ("", _) => {
                warn!("provided attribute name is empty; ignoring");
                false
            }
            ("kind", AttributeValue::String(s)) => {
                self.kind(s);
                true
            }
            ("key", AttributeValue::String(s)) => {
                self.key(s);
                true
            }
            ("name", AttributeValue::String(s)) => {
                self.name(s);
                true
            }
            ("name", AttributeValue::Null) => {
                self.name = None;
                true
            }
            ("anonymous", AttributeValue::Bool(b)) => {
                self.anonymous(b);
                true
            }
            ("kind" | "key" | "name" | "anonymous", _) => false,
            (_, AttributeValue::Null) => {
                self.attributes.remove(attribute_name);
                true
            }
            (_, value) => {
                self.attributes.insert(attribute_name.to_owned(), value);
                true
            }
        }
    }

    pub fn build(&self) -> Result<Context, ContextError> {
        let kind = Kind::try_from(self.kind.as_str())?;
        if self.key.is_empty() {
            return Err(ContextError::EmptyKey);
        }

        Ok(Context {
            kind,
            key: self.key.clone(),
            name: self.name.clone(),
            anonymous: self.anonymous,
            attributes: self.attributes.clone(),
            contexts: None,
        })
    }
}

/// Builds a multi-kind [Context] out of single-kind ones.
///
/// Adding a multi-context adds each of its parts. Building with only one context returns that
/// context unchanged.
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        Self {
            contexts: Vec::with_capacity(DEFAULT_MULTI_BUILDER_CAPACITY),
        }
    }

    pub fn add_context(&mut self, context: Context) -> &mut Self {
        match context.contexts {
            Some(contexts) => self.contexts.extend(contexts),
            None => self.contexts.push(context),
        }
        self
    }

    pub fn build(&self) -> Result<Context, ContextError> {
        if let Some(duplicate) = self.contexts.iter().map(Context::kind).duplicates().next() {
            return Err(ContextError::DuplicateKind(duplicate.to_string()));
        }

        match self.contexts.as_slice() {
            [] => Err(ContextError::NoContexts),
            [single] => Ok(single.clone()),
            many => {
                let contexts = many
                    .iter()
                    .cloned()
                    .sorted_by(|a, b| a.kind.cmp(&b.kind))
                    .collect();
                Ok(Context {
                    kind: Kind::multi(),
                    key: String::new(),
                    name: None,
                    anonymous: false,
                    attributes: HashMap::new(),
                    contexts: Some(contexts),
                })
            }
        }
    }
}

impl Default for MultiContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
