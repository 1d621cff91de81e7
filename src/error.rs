use thiserror::Error;

use crate::eval::Error;
use crate::variation::VariationIndex;

/// A problem with flag or segment data discovered while evaluating.
///
/// These never escape [crate::evaluate]; they are reported as [Error::MalformedFlag] with the
/// message attached to the [crate::EvalResult].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("variation index {index} is out of range for a flag with {count} variations")]
    InvalidVariationIndex { index: VariationIndex, count: usize },

    #[error("rule or fallthrough has no variation or rollout")]
    NoVariationOrRollout,

    #[error("invalid attribute reference \"{reference}\": {reason}")]
    InvalidAttributeReference { reference: String, reason: String },

    #[error("prerequisite relationship to \"{0}\" caused a circular reference")]
    CircularPrerequisite(String),

    #[error("segment rule referencing \"{0}\" caused a circular reference")]
    CircularSegment(String),
}

impl EvalError {
    /// The error kind reported to callers.
    pub fn kind(&self) -> Error {
        Error::MalformedFlag
    }

    pub(crate) fn is_circular(&self) -> bool {
        matches!(
            self,
            EvalError::CircularPrerequisite(_) | EvalError::CircularSegment(_)
        )
    }
}

/// Returned by the context builders when the requested context cannot be built.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("invalid context kind \"{kind}\": {reason}")]
    InvalidKind { kind: String, reason: &'static str },

    #[error("context key must not be empty")]
    EmptyKey,

    #[error("multi-context contains more than one context of kind \"{0}\"")]
    DuplicateKind(String),

    #[error("multi-context must contain at least one context")]
    NoContexts,
}
