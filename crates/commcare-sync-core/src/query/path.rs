//! Dotted path queries over JSON records.
//!
//! Syntax: segments separated by `.`; `*` matches every child of an object
//! or array; an all-digit segment indexes an array; any other segment is a
//! field name. A leading `$` anchors the path at the record root instead
//! of the current row context. A named segment applied to an array looks
//! the field up in each element, so `form.case.@case_id` works whether a
//! form carries one case block or several.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::QueryError;
use crate::value::Located;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    source: String,
    anchored: bool,
    segments: Vec<Segment>,
}

impl Path {
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        let invalid = |reason: &str| QueryError::InvalidPath {
            path: text.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let (anchored, rest) = match trimmed.strip_prefix('$') {
            Some(rest) if rest.is_empty() => (true, ""),
            Some(rest) => match rest.strip_prefix('.') {
                Some(rest) => (true, rest),
                None => (false, trimmed),
            },
            None => (false, trimmed),
        };

        let mut segments = Vec::new();
        if !rest.is_empty() {
            for part in rest.split('.') {
                if part.is_empty() {
                    return Err(invalid("empty segment"));
                }
                let segment = if part == "*" {
                    Segment::Wildcard
                } else if part.bytes().all(|b| b.is_ascii_digit()) {
                    let index = part.parse().map_err(|_| invalid("index out of range"))?;
                    Segment::Index(index)
                } else {
                    Segment::Field(part.to_string())
                };
                segments.push(segment);
            }
        }

        Ok(Self {
            source: trimmed.to_string(),
            anchored,
            segments,
        })
    }

    /// Whether the path starts at the record root.
    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// Every match under `context`, in document order.
    pub fn find(&self, context: &Value) -> Vec<Located> {
        let root = if self.anchored { "$" } else { "@" };
        let mut current: Vec<(&Value, String)> = vec![(context, root.to_string())];

        for segment in &self.segments {
            let mut next = Vec::new();
            for (value, at) in current {
                step(segment, value, &at, &mut next);
            }
            current = next;
        }

        current
            .into_iter()
            .map(|(value, path)| Located {
                value: value.clone(),
                path,
            })
            .collect()
    }
}

fn step<'a>(segment: &Segment, value: &'a Value, at: &str, out: &mut Vec<(&'a Value, String)>) {
    match (segment, value) {
        (Segment::Field(name), Value::Object(map)) => {
            if let Some(child) = map.get(name) {
                out.push((child, format!("{}.{}", at, name)));
            }
        }
        (Segment::Field(name), Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if let Some(child) = item.get(name.as_str()) {
                    out.push((child, format!("{}[{}].{}", at, i, name)));
                }
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(child) = items.get(*i) {
                out.push((child, format!("{}[{}]", at, i)));
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for (key, child) in map {
                out.push((child, format!("{}.{}", at, key)));
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for (i, child) in items.iter().enumerate() {
                out.push((child, format!("{}[{}]", at, i)));
            }
        }
        _ => {}
    }
}

impl FromStr for Path {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
