//! Built-in functions available to `{"apply": ...}` expressions.
//!
//! Every function is a positional `Fn(Vec<Extracted>)`. Arguments that
//! need the canonical cell shape are normalized through
//! [`bind_normalized`]; `count` deliberately sees its raw argument so it
//! can count matches.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{BindError, ExtractError};
use crate::value::{bind_normalized, ExtractFn, Extracted, Signature};
use crate::watermark::{format_timestamp, parse_timestamp};

pub const BOOL: Signature = Signature::new("bool", &["value"]);
pub const STR2NUM: Signature = Signature::new("str2num", &["value"]);
pub const STR2DATE: Signature = Signature::new("str2date", &["value"]);
pub const JOIN: Signature = Signature::new("join", &["sep", "values"]);
pub const COUNT: Signature = Signature::new("count", &["values"]);
pub const FIRST: Signature = Signature::new("first", &["values"]);
pub const DEFAULT: Signature = Signature::new("default", &["value", "fallback"]);

type Builder = fn() -> Result<ExtractFn, BindError>;

const BUILTINS: &[(Signature, Builder)] = &[
    (BOOL, build_bool),
    (STR2NUM, build_str2num),
    (STR2DATE, build_str2date),
    (JOIN, build_join),
    (COUNT, build_count),
    (FIRST, build_first),
    (DEFAULT, build_default),
];

/// A built-in resolved by name.
#[derive(Clone)]
pub struct Function {
    pub signature: Signature,
    pub call: ExtractFn,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Function({})", self.signature.name)
    }
}

/// Look up a built-in by name.
pub fn lookup(name: &str) -> Result<Option<Function>, BindError> {
    let Some((signature, build)) = BUILTINS.iter().find(|(s, _)| s.name == name) else {
        return Ok(None);
    };
    Ok(Some(Function {
        signature: *signature,
        call: build()?,
    }))
}

fn build_bool() -> Result<ExtractFn, BindError> {
    Ok(Arc::new(bind_normalized(&BOOL, "value", |args| {
        Ok(Value::Bool(truthy(&scalar(&args, 0))).into())
    })?))
}

fn build_str2num() -> Result<ExtractFn, BindError> {
    Ok(Arc::new(bind_normalized(&STR2NUM, "value", |args| {
        Ok(str2num(&scalar(&args, 0)).into())
    })?))
}

fn build_str2date() -> Result<ExtractFn, BindError> {
    Ok(Arc::new(bind_normalized(&STR2DATE, "value", |args| {
        let parsed = scalar(&args, 0)
            .as_str()
            .and_then(parse_timestamp)
            .map(|t| Value::String(format_timestamp(t)))
            .unwrap_or(Value::Null);
        Ok(parsed.into())
    })?))
}

fn build_join() -> Result<ExtractFn, BindError> {
    let with_values = bind_normalized(&JOIN, "values", |args| {
        let sep = text(&scalar(&args, 0));
        let joined = match scalar(&args, 1) {
            Value::Array(items) => items.iter().map(text).collect::<Vec<_>>().join(&sep),
            other => text(&other),
        };
        Ok(Value::String(joined).into())
    })?;
    Ok(Arc::new(bind_normalized(&JOIN, "sep", with_values)?))
}

fn build_count() -> Result<ExtractFn, BindError> {
    Ok(Arc::new(
        |args: Vec<Extracted>| -> Result<Extracted, ExtractError> {
            let n = match args.first() {
                Some(arg) => count(arg)?,
                None => 0,
            };
            Ok(Value::from(n).into())
        },
    ))
}

fn build_first() -> Result<ExtractFn, BindError> {
    Ok(Arc::new(bind_normalized(&FIRST, "values", |args| {
        let first = match scalar(&args, 0) {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        };
        Ok(first.into())
    })?))
}

fn build_default() -> Result<ExtractFn, BindError> {
    let with_fallback = bind_normalized(&DEFAULT, "fallback", |args| {
        let value = scalar(&args, 0);
        if is_missing(&value) {
            Ok(scalar(&args, 1).into())
        } else {
            Ok(value.into())
        }
    })?;
    Ok(Arc::new(bind_normalized(&DEFAULT, "value", with_fallback)?))
}

/// The already-normalized argument at `index`, or `null`.
fn scalar(args: &[Extracted], index: usize) -> Value {
    match args.get(index) {
        Some(Extracted::Value(v)) => v.clone(),
        _ => Value::Null,
    }
}

fn count(arg: &Extracted) -> Result<usize, ExtractError> {
    Ok(match arg {
        Extracted::List(items) => items.len(),
        Extracted::Sequence(seq) => seq.iterate()?.len(),
        Extracted::Value(Value::Array(items)) => items.len(),
        Extracted::Value(Value::Null) => 0,
        Extracted::Value(_) | Extracted::Located(_) => 1,
    })
}

fn str2num(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else {
                s.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        _ => Value::Null,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Truthiness used by `bool` and table filters.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// Whether a normalized cell carries no value.
pub fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::Replayable;
    use crate::value::{normalize, Located};
    use serde_json::json;

    fn call(name: &str, args: Vec<Extracted>) -> Value {
        let f = lookup(name).unwrap().unwrap();
        normalize(&(f.call)(args).unwrap()).unwrap()
    }

    fn located(v: Value) -> Extracted {
        Extracted::Located(Located {
            value: v,
            path: "@.x".into(),
        })
    }

    #[test]
    fn test_unknown_function() {
        assert!(lookup("nope").unwrap().is_none());
    }

    #[test]
    fn test_bool() {
        assert_eq!(call("bool", vec![Extracted::List(vec![located(json!("yes"))])]), json!(true));
        assert_eq!(call("bool", vec![Extracted::absent()]), json!(false));
        assert_eq!(call("bool", vec![json!("false").into()]), json!(false));
    }

    #[test]
    fn test_str2num_and_date() {
        assert_eq!(call("str2num", vec![located(json!("42"))]), json!(42));
        assert_eq!(call("str2num", vec![json!("1.5").into()]), json!(1.5));
        assert_eq!(call("str2num", vec![json!("abc").into()]), Value::Null);
        assert_eq!(
            call("str2date", vec![json!("2012-03-04 10:11:12").into()]),
            json!("2012-03-04T10:11:12.000000Z")
        );
        assert_eq!(call("str2date", vec![json!("soon").into()]), Value::Null);
    }

    #[test]
    fn test_join() {
        let values = Extracted::List(vec![located(json!("a")), located(json!(2))]);
        assert_eq!(call("join", vec![json!(" ").into(), values]), json!("a 2"));
        assert_eq!(
            call("join", vec![Extracted::List(vec![json!(",").into()]), located(json!("solo"))]),
            json!("solo")
        );
    }

    #[test]
    fn test_count_sees_raw_matches() {
        let seq = Extracted::Sequence(Replayable::new(|| {
            vec![located(json!(1)), located(json!(2)), located(json!(3))]
        }));
        assert_eq!(call("count", vec![seq]), json!(3));
        assert_eq!(call("count", vec![Extracted::List(vec![located(json!([1, 2]))])]), json!(1));
        assert_eq!(call("count", vec![Extracted::absent()]), json!(0));
    }

    #[test]
    fn test_first_and_default() {
        let values = Extracted::List(vec![located(json!("x")), located(json!("y"))]);
        assert_eq!(call("first", vec![values]), json!("x"));
        assert_eq!(
            call("default", vec![Extracted::absent(), json!("n/a").into()]),
            json!("n/a")
        );
        assert_eq!(
            call("default", vec![located(json!("v")), json!("n/a").into()]),
            json!("v")
        );
    }
}
