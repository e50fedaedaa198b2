//! Captured method calls.
//!
//! Arguments are converted to canonical JSON values when the invocation is
//! built, so key rendering and signature hashing only ever see plain data
//! whose textual form depends on value, never on identity or field order.

use serde::Serialize;
use serde_json::Value;

use super::error::{SignatureError, TemplateError};

/// A single call to an advised method: its identifier and ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    method: String,
    args: Vec<Value>,
}

impl Invocation {
    /// Start an invocation with no arguments.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument, capturing it in canonical form.
    pub fn arg<A>(mut self, arg: &A) -> Result<Self, SignatureError>
    where
        A: Serialize + ?Sized,
    {
        let index = self.args.len();
        let value = serde_json::to_value(arg)
            .map_err(|source| SignatureError::Unserializable { index, source })?;
        self.args.push(canonicalize(value));
        Ok(self)
    }

    /// Build an invocation from already-captured values.
    pub fn with_values(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args: args.into_iter().map(canonicalize).collect(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Positional argument lookup used by `${args[N]}`.
    pub fn arg_at(&self, index: usize) -> Result<&Value, TemplateError> {
        self.args.get(index).ok_or(TemplateError::ArgumentOutOfRange {
            index,
            len: self.args.len(),
        })
    }
}

/// Rebuild a value with every object's keys in sorted order.
pub(crate) fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        scalar => scalar,
    }
}
