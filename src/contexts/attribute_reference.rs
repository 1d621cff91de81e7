use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Why a string could not be parsed as a [Reference].
#[derive(Clone, Debug, Error, Hash, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference cannot be empty")]
    Empty,
    #[error("reference contains an empty path component")]
    EmptyComponent,
    #[error("reference contains an invalid escape sequence")]
    InvalidEscape,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum Path {
    /// A top-level attribute name; does not start with '/'.
    Name,
    /// A slash-delimited path into nested objects, already unescaped.
    Components(Vec<String>),
    Invalid(ReferenceError),
}

/// An attribute name or path expression identifying a value within a [crate::Context].
///
/// Strings starting with '/' are slash-delimited paths: the first component names an attribute and
/// each later component names a property of a nested object. Inside a component, "~1" stands for
/// '/' and "~0" for '~'. Any other string is the literal name of a top-level attribute.
///
/// Parsing happens once, when the reference is built, so flag data can carry references that are
/// ready to use on every evaluation. An unparseable string still produces a `Reference`; it
/// reports itself through [Reference::is_valid] and [Reference::error].
///
/// ```
/// # use flag_evaluation_engine::Reference;
/// assert_eq!(Reference::new("name").depth(), 1);
/// assert_eq!(Reference::new("/address/city").component(1), Some("city"));
/// assert!(!Reference::new("/a//b").is_valid());
/// ```
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Reference {
    raw: String,
    path: Path,
}

impl Reference {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let path = parse(&raw);
        Self { raw, path }
    }

    /// Builds a reference to a top-level attribute whose name is taken literally, as flag data
    /// without a context kind is interpreted. Names starting with '/' are escaped into a
    /// single-component path.
    pub fn literal(name: &str) -> Self {
        if name.starts_with('/') {
            Self::new(format!("/{}", name.replace('~', "~0").replace('/', "~1")))
        } else {
            Self::new(name)
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.path, Path::Invalid(_))
    }

    pub fn error(&self) -> Option<&ReferenceError> {
        match &self.path {
            Path::Invalid(e) => Some(e),
            _ => None,
        }
    }

    /// Number of path components; zero for an invalid reference.
    pub fn depth(&self) -> usize {
        match &self.path {
            Path::Name => 1,
            Path::Components(components) => components.len(),
            Path::Invalid(_) => 0,
        }
    }

    pub fn component(&self, index: usize) -> Option<&str> {
        match (&self.path, index) {
            (Path::Name, 0) => Some(&self.raw),
            (Path::Components(components), _) => components.get(index).map(String::as_str),
            _ => None,
        }
    }

    /// The string this reference was built from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    // True when the reference names the context's "kind" attribute.
    pub(crate) fn is_kind(&self) -> bool {
        self.depth() == 1 && self.component(0) == Some("kind")
    }
}

fn parse(raw: &str) -> Path {
    let pointer = match raw.strip_prefix('/') {
        _ if raw.is_empty() => return Path::Invalid(ReferenceError::Empty),
        None => return Path::Name,
        Some("") => return Path::Invalid(ReferenceError::Empty),
        Some(pointer) => pointer,
    };

    pointer
        .split('/')
        .map(|part| {
            if part.is_empty() {
                Err(ReferenceError::EmptyComponent)
            } else {
                unescape(part)
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map_or_else(Path::Invalid, Path::Components)
}

fn unescape(part: &str) -> Result<String, ReferenceError> {
    if !part.contains('~') {
        return Ok(part.to_owned());
    }

    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(ReferenceError::InvalidEscape),
        }
    }
    Ok(out)
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Reference {
    fn from(raw: &str) -> Self {
        Reference::new(raw)
    }
}

impl From<String> for Reference {
    fn from(raw: String) -> Self {
        Reference::new(raw)
    }
}

impl Serialize for Reference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Reference::new)
    }
}
