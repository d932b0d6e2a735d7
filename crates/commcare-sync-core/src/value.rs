//! Extraction results and the value normalizer.
//!
//! Applying an extraction rule to a record yields an [`Extracted`]: a
//! plain JSON value, a list of results, a path match carrying provenance
//! ([`Located`]), or a deferred [`Replayable`] sequence. [`normalize`]
//! collapses all of these into the canonical cell shape so that row
//! builders never care whether a rule matched zero, one, or many times.
//!
//! # Algorithm
//!
//! 1. A replayable sequence is realized and treated as a list.
//! 2. A list (or JSON array) of length 0 stays empty, length 1 collapses
//!    to its normalized element, longer lists normalize element-wise.
//! 3. A located match is replaced by its (normalized) value.
//! 4. Anything else is returned unchanged.
//!
//! The result is idempotent: `normalize(normalize(x)) == normalize(x)`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{BindError, ExtractError, ReplayError};
use crate::replay::Replayable;

/// A value matched by a path query, with the concrete path it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Located {
    pub value: Value,
    pub path: String,
}

/// Raw output of an extraction rule.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Extracted {
    Value(Value),
    List(Vec<Extracted>),
    Located(Located),
    Sequence(Replayable<Extracted>),
}

impl Extracted {
    /// The result of a rule that matched nothing.
    pub fn absent() -> Self {
        Extracted::List(Vec::new())
    }

    /// JSON rendering that expands replayable sequences.
    pub fn to_plain_value(&self) -> Result<Value, ReplayError> {
        serde_json::to_value(self).map_err(|e| ReplayError::new(e.to_string()))
    }
}

impl From<Value> for Extracted {
    fn from(value: Value) -> Self {
        Extracted::Value(value)
    }
}

impl From<Located> for Extracted {
    fn from(located: Located) -> Self {
        Extracted::Located(located)
    }
}

/// Collapse an extraction result into its canonical cell shape.
///
/// An empty result is returned as an empty JSON array; the row builder
/// decides what an empty cell becomes.
pub fn normalize(value: &Extracted) -> Result<Value, ReplayError> {
    match value {
        Extracted::Sequence(seq) => normalize_items(seq.iterate()?.as_slice()),
        Extracted::List(items) => normalize_items(items),
        Extracted::Located(located) => Ok(normalize_json(&located.value)),
        Extracted::Value(value) => Ok(normalize_json(value)),
    }
}

fn normalize_items(items: &[Extracted]) -> Result<Value, ReplayError> {
    match items {
        [] => Ok(Value::Array(Vec::new())),
        [only] => normalize(only),
        many => many
            .iter()
            .map(normalize)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
    }
}

fn normalize_json(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() == 1 => normalize_json(&items[0]),
        Value::Array(items) => Value::Array(items.iter().map(normalize_json).collect()),
        other => other.clone(),
    }
}

/// Ordered parameter names of a function, known statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

impl Signature {
    pub const fn new(name: &'static str, params: &'static [&'static str]) -> Self {
        Self { name, params }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn position(&self, param: &str) -> Option<usize> {
        self.params.iter().position(|p| *p == param)
    }
}

/// Positional function over extraction results.
pub type ExtractFn = Arc<dyn Fn(Vec<Extracted>) -> Result<Extracted, ExtractError> + Send + Sync>;

/// Wrap `f` so that the argument named `param` is normalized before the
/// call. Other arguments pass through untouched.
///
/// The parameter position is resolved here, once; an unknown name fails
/// immediately rather than on first call.
///
/// ```rust
/// use commcare_sync_core::value::{bind_normalized, Extracted, Signature};
/// use serde_json::json;
///
/// const FIRST: Signature = Signature::new("first", &["values"]);
/// let first = bind_normalized(&FIRST, "values", |args: Vec<Extracted>| {
///     Ok(args.into_iter().next().unwrap_or_else(Extracted::absent))
/// })
/// .unwrap();
///
/// let out = first(vec![Extracted::List(vec![json!("x").into()])]).unwrap();
/// assert_eq!(out.to_plain_value().unwrap(), json!("x"));
/// ```
pub fn bind_normalized<F>(
    signature: &Signature,
    param: &str,
    f: F,
) -> Result<impl Fn(Vec<Extracted>) -> Result<Extracted, ExtractError> + Send + Sync + 'static, BindError>
where
    F: Fn(Vec<Extracted>) -> Result<Extracted, ExtractError> + Send + Sync + 'static,
{
    let position = signature
        .position(param)
        .ok_or_else(|| BindError::UnknownParameter {
            function: signature.name.to_string(),
            param: param.to_string(),
        })?;

    Ok(move |mut args: Vec<Extracted>| {
        if let Some(arg) = args.get_mut(position) {
            *arg = Extracted::Value(normalize(arg)?);
        }
        f(args)
    })
}
