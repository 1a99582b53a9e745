//! Value extraction from decoded payloads.
//!
//! Path syntax: `$.a.b[0]`, `a.b[0]`, `a["key with.dots"]`. An empty path
//! (or `$`) selects the whole payload.

use crate::error::{CoreError, Result};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A parsed extraction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

impl PathExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let raw = expr.trim();
        let mut body = raw.strip_prefix('$').unwrap_or(raw);
        let mut segments = Vec::new();
        let err = |msg: &str| CoreError::Extraction(format!("{msg} in path '{raw}'"));

        body = body.strip_prefix('.').unwrap_or(body);
        while !body.is_empty() {
            if let Some(inner) = body.strip_prefix('[') {
                let close = inner.find(']').ok_or_else(|| err("unclosed '['"))?;
                let token = &inner[..close];
                if let Some(quoted) = token
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                {
                    segments.push(Segment::Field(quoted.to_string()));
                } else {
                    let idx = token.parse().map_err(|_| err("bad index"))?;
                    segments.push(Segment::Index(idx));
                }
                body = &inner[close + 1..];
                body = body.strip_prefix('.').unwrap_or(body);
            } else {
                let end = body.find(|c: char| c == '.' || c == '[').unwrap_or(body.len());
                let field = &body[..end];
                if field.is_empty() {
                    return Err(err("empty field"));
                }
                segments.push(Segment::Field(field.to_string()));
                body = &body[end..];
                if let Some(next) = body.strip_prefix('.') {
                    if next.is_empty() {
                        return Err(err("trailing '.'"));
                    }
                    body = next;
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Whether this path selects the whole payload.
    pub fn is_identity(&self) -> bool {
        self.segments.is_empty()
    }

    /// Apply the path to a decoded payload.
    pub fn apply(&self, value: &Value) -> Result<Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name).ok_or_else(|| {
                    CoreError::Extraction(format!("field '{name}' not found ({})", self.raw))
                })?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i).ok_or_else(|| {
                    CoreError::Extraction(format!("index {i} out of range ({})", self.raw))
                })?,
                (seg, other) => {
                    return Err(CoreError::Extraction(format!(
                        "cannot apply {seg:?} to {} ({})",
                        type_name(other),
                        self.raw
                    )))
                }
            };
        }
        Ok(current.clone())
    }
}

impl FromStr for PathExpr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse `path` and apply it to `value`.
pub fn extract(path: &str, value: &Value) -> Result<Value> {
    PathExpr::parse(path)?.apply(value)
}
