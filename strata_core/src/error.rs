use crate::bitstream::BitStreamError;
use crate::variant::VariantError;
use thiserror::Error;

/// Defines the failure categories surfaced by the engine.
///
/// Construction and sanitization errors are fatal for the model they come from.
/// A cracking failure means "this subtree does not match this input region" and is
/// interpreted by the enclosing Choice or Array before it escalates. A soft error
/// lets a caller skip the current operation instead of aborting.
#[derive(Error, Debug, Clone)]
pub enum StrataError {
    /// The model description is invalid (bad attribute, overlapping flags,
    /// unresolvable reference).
    #[error("Error, {path}: {message}")]
    Construction { path: String, message: String },

    /// A value could not be coerced to the representation an element requires.
    #[error("Error, {path}: {message}")]
    Sanitize { path: String, message: String },

    /// Input did not match the model at some position.
    #[error(transparent)]
    Cracking(#[from] CrackingFailure),

    /// Non-fatal condition a caller may choose to skip.
    #[error("{0}")]
    Soft(String),

    #[error(transparent)]
    BitStream(#[from] BitStreamError),

    #[error(transparent)]
    Variant(#[from] VariantError),
}

impl StrataError {
    pub fn construction(path: impl Into<String>, message: impl Into<String>) -> Self {
        StrataError::Construction {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn sanitize(path: impl Into<String>, message: impl Into<String>) -> Self {
        StrataError::Sanitize {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn soft(message: impl Into<String>) -> Self {
        StrataError::Soft(message.into())
    }

    pub fn is_cracking_failure(&self) -> bool {
        matches!(self, StrataError::Cracking(_))
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, StrataError::Soft(_))
    }
}

/// A recoverable parse mismatch.
///
/// `element` is the full name of the element that failed, `position` the absolute
/// bit offset in the outermost input at the time of failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{element} failed to crack at bit {position}. {message}")]
pub struct CrackingFailure {
    pub element: String,
    pub position: u64,
    pub message: String,
    #[source]
    pub cause: Option<Box<CrackingFailure>>,
}

impl CrackingFailure {
    pub fn new(element: impl Into<String>, position: u64, message: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            position,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: CrackingFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Innermost failure in the cause chain.
    pub fn root_cause(&self) -> &CrackingFailure {
        let mut current = self;
        while let Some(next) = current.cause.as_deref() {
            current = next;
        }
        current
    }
}

pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn cracking_failure_exposes_cause_chain() {
        let inner = CrackingFailure::new("Model.items.items_2", 48, "Token did not match.");
        let outer = CrackingFailure::new("Model.items", 16, "Only cracked 2 of 3 array entries.")
            .with_cause(inner.clone());

        assert_eq!(
            outer.to_string(),
            "Model.items failed to crack at bit 16. Only cracked 2 of 3 array entries."
        );
        assert!(outer.source().is_some(), "Cause should surface through Error::source");
        assert_eq!(outer.root_cause(), &inner);
    }

    #[test]
    fn only_cracking_variant_is_recoverable() {
        let crack: StrataError = CrackingFailure::new("A", 0, "x").into();
        assert!(crack.is_cracking_failure());
        assert!(!StrataError::construction("A", "bad").is_cracking_failure());
        assert!(StrataError::soft("skip").is_soft());
    }
}
