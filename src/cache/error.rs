//! Error taxonomy for key resolution, storage access and advised calls.

use std::time::Duration;

use thiserror::Error;

/// A key template could not be parsed or rendered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at byte {offset} in `{template}`")]
    Unterminated { template: String, offset: usize },
    #[error("empty placeholder at byte {offset} in `{template}`")]
    EmptyPlaceholder { template: String, offset: usize },
    #[error("unknown placeholder `${{{expr}}}` in `{template}`")]
    UnknownPlaceholder { template: String, expr: String },
    #[error("argument index {index} out of range for {len} argument(s)")]
    ArgumentOutOfRange { index: usize, len: usize },
    #[error("argument {index} is not a collection and cannot be iterated")]
    NotIterable { index: usize },
    #[error("template `{template}` uses `${{it}}` without an iteration source")]
    UnboundIteration { template: String },
}

/// An argument could not be captured in canonical form.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("argument {index} is not serializable: {source}")]
    Unserializable {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a [`Storage`](super::Storage) backend.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("storage backend rejected `{op}`: {message}")]
    Rejected { op: &'static str, message: String },
}

impl StorageError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(op: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            op,
            message: message.into(),
        }
    }
}

/// Errors raised by the caching layer itself.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key template error: {0}")]
    Template(#[from] TemplateError),
    #[error("argument signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("cache storage unavailable during `{op}`: {source}")]
    StorageUnavailable {
        op: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("population of `{key}` timed out after {after:?}")]
    Timeout { key: String, after: Duration },
    #[error("failed to encode value for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("write of `{key}` did not complete: {reason}")]
    WriteAborted { key: String, reason: String },
    #[error("backend `external` configured but no storage was supplied")]
    MissingStorage,
}

impl CacheError {
    pub(crate) fn storage(op: &'static str, source: StorageError) -> Self {
        Self::StorageUnavailable { op, source }
    }

    /// Returns true for programming errors in a declaration (bad template or
    /// unserializable argument), as opposed to operational failures.
    pub fn is_declaration_error(&self) -> bool {
        matches!(self, Self::Template(_) | Self::Signature(_))
    }
}

/// Outcome of an advised call that failed.
///
/// Errors returned by the wrapped call pass through untouched in
/// [`AdviceError::Call`]; everything else is a [`CacheError`].
#[derive(Debug, Error)]
pub enum AdviceError<E> {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("wrapped call failed")]
    Call(#[source] E),
}

impl<E> AdviceError<E> {
    /// Returns the wrapped call's own error, if that is what failed.
    pub fn into_call(self) -> Option<E> {
        match self {
            Self::Call(err) => Some(err),
            Self::Cache(_) => None,
        }
    }

    pub fn as_cache(&self) -> Option<&CacheError> {
        match self {
            Self::Cache(err) => Some(err),
            Self::Call(_) => None,
        }
    }
}
