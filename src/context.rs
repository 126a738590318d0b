//! Run context and the projection expression language.
//!
//! A [`RunContext`] is the in-memory working state of a run: a map from
//! string keys to JSON values. The reserved `bag` sub-map holds
//! user-supplied input and human approval values; every other key is a node
//! id mapping to that node's captured output. The context exists only in
//! memory during execution — durable state is the event sequence plus the
//! latest snapshot.
//!
//! # Projection grammar
//!
//! Node `expr` strings are compiled into a [`Projection`]: a dot-separated
//! path resolved from the context root, optionally followed by a single
//! transform. This is the entire language; there is no host-code
//! evaluation.
//!
//! ```text
//! projection := [ path ] [ "|" transform ]
//! path       := segment ( "." segment )*
//! segment    := [A-Za-z0-9_-]+
//! transform  := "upper" | "lower" | "length"
//! ```
//!
//! - An empty path projects the whole `bag`.
//! - A path that resolves nowhere projects JSON `null`.
//! - `upper`/`lower` apply to strings (anything else passes through
//!   unchanged); `length` yields the length of a string, array, or object
//!   and `null` otherwise.
//!
//! # Examples
//!
//! ```rust
//! use gantry::context::{Projection, RunContext};
//! use serde_json::json;
//!
//! let mut ctx = RunContext::new(json!({"parcel": {"kg": 3}, "dest": "oslo"}));
//! ctx.record_output("quote", json!({"carrier": "acme", "eur": 12.5}));
//!
//! let p = Projection::parse("quote.carrier | upper").unwrap();
//! assert_eq!(p.apply(&ctx), json!("ACME"));
//!
//! let whole_bag = Projection::parse("").unwrap();
//! assert_eq!(whole_bag.apply(&ctx)["dest"], json!("oslo"));
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use thiserror::Error;

/// Reserved context key for user-supplied input and approvals.
pub const BAG_KEY: &str = "bag";

/// Mutable working state of a single run.
///
/// Cheap to clone relative to a run's lifetime; the engine clones it into
/// snapshots and decision records. All mutation goes through the reducer
/// during execution, which keeps live state and replayed state identical.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunContext {
    values: FxHashMap<String, Value>,
}

impl RunContext {
    /// Create a context whose `bag` holds the given initial input.
    ///
    /// Non-object values are wrapped under `bag` as-is.
    #[must_use]
    pub fn new(initial_bag: Value) -> Self {
        let mut values = FxHashMap::default();
        values.insert(BAG_KEY.to_string(), initial_bag);
        Self { values }
    }

    /// The `bag` sub-map (user input and approvals).
    #[must_use]
    pub fn bag(&self) -> &Value {
        self.values.get(BAG_KEY).unwrap_or(&Value::Null)
    }

    /// Write a single key into the `bag`, creating it if needed.
    ///
    /// Used by the reducer to land approval values under a human node's
    /// `approval_key`.
    pub fn set_bag_entry(&mut self, key: &str, value: Value) {
        let bag = self
            .values
            .entry(BAG_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !bag.is_object() {
            *bag = Value::Object(Map::new());
        }
        if let Some(map) = bag.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Record a node's output under its node id.
    pub fn record_output(&mut self, node_id: &str, output: Value) {
        self.values.insert(node_id.to_string(), output);
    }

    /// A node's captured output, if it has completed.
    #[must_use]
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.values.get(node_id)
    }

    /// Resolve a raw path from the context root.
    #[must_use]
    pub fn resolve(&self, path: &[String]) -> Value {
        let Some((head, rest)) = path.split_first() else {
            return self.bag().clone();
        };
        let mut cursor = match self.values.get(head) {
            Some(v) => v,
            None => return Value::Null,
        };
        for segment in rest {
            cursor = match cursor.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            };
        }
        cursor.clone()
    }

    /// Serialize the whole context into one JSON object (snapshot payload).
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        for k in keys {
            map.insert(k.clone(), self.values[k].clone());
        }
        Value::Object(map)
    }

    /// Rebuild a context from a snapshot payload produced by
    /// [`to_value`](Self::to_value). Non-object input yields an empty
    /// context.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let mut values = FxHashMap::default();
        if let Value::Object(map) = value {
            for (k, v) in map {
                values.insert(k, v);
            }
        }
        Self { values }
    }
}

/// Post-resolution transform applied by a projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transform {
    Upper,
    Lower,
    Length,
}

impl Transform {
    fn apply(self, value: Value) -> Value {
        match self {
            Transform::Upper => match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            },
            Transform::Lower => match value {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            },
            Transform::Length => match value {
                Value::String(s) => Value::from(s.chars().count()),
                Value::Array(a) => Value::from(a.len()),
                Value::Object(o) => Value::from(o.len()),
                _ => Value::Null,
            },
        }
    }
}

/// A compiled projection expression.
///
/// Parsed once at graph compilation; [`apply`](Self::apply) is pure over
/// the context, which is what makes Task nodes deterministic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    path: Vec<String>,
    transform: Option<Transform>,
    source: String,
}

/// Rejected projection expressions, with the offending fragment.
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("unknown transform `{0}` in projection")]
    #[diagnostic(
        code(gantry::context::unknown_transform),
        help("Supported transforms: upper, lower, length.")
    )]
    UnknownTransform(String),

    #[error("empty path segment in projection `{0}`")]
    #[diagnostic(
        code(gantry::context::empty_segment),
        help("Remove doubled or trailing dots from the path.")
    )]
    EmptySegment(String),

    #[error("invalid character in projection segment `{0}`")]
    #[diagnostic(
        code(gantry::context::bad_segment),
        help("Segments may contain letters, digits, `_`, and `-` only.")
    )]
    BadSegment(String),

    #[error("projection may contain at most one `|` transform: `{0}`")]
    #[diagnostic(code(gantry::context::multiple_transforms))]
    MultipleTransforms(String),
}

impl Projection {
    /// Parse an expression string into a projection.
    pub fn parse(expr: &str) -> Result<Self, ProjectionError> {
        let source = expr.trim().to_string();
        let mut parts = source.split('|');
        let path_part = parts.next().unwrap_or("").trim();
        let transform = match parts.next() {
            None => None,
            Some(t) => Some(match t.trim() {
                "upper" => Transform::Upper,
                "lower" => Transform::Lower,
                "length" => Transform::Length,
                other => return Err(ProjectionError::UnknownTransform(other.to_string())),
            }),
        };
        if parts.next().is_some() {
            return Err(ProjectionError::MultipleTransforms(source));
        }

        let mut path = Vec::new();
        if !path_part.is_empty() {
            for segment in path_part.split('.') {
                let segment = segment.trim();
                if segment.is_empty() {
                    return Err(ProjectionError::EmptySegment(source));
                }
                if !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(ProjectionError::BadSegment(segment.to_string()));
                }
                path.push(segment.to_string());
            }
        }

        Ok(Self {
            path,
            transform,
            source,
        })
    }

    /// The projection for an absent `expr`: the whole bag.
    #[must_use]
    pub fn whole_bag() -> Self {
        Self {
            path: Vec::new(),
            transform: None,
            source: String::new(),
        }
    }

    /// Evaluate against a context. Pure; never fails.
    #[must_use]
    pub fn apply(&self, ctx: &RunContext) -> Value {
        let resolved = ctx.resolve(&self.path);
        match self.transform {
            Some(t) => t.apply(resolved),
            None => resolved,
        }
    }

    /// The original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut c = RunContext::new(json!({"who": "ada", "n": [1, 2, 3]}));
        c.record_output("fetch", json!({"status": "ok", "rows": 7}));
        c
    }

    #[test]
    fn empty_expr_projects_bag() {
        let p = Projection::parse("  ").unwrap();
        assert_eq!(p.apply(&ctx())["who"], json!("ada"));
    }

    #[test]
    fn path_into_node_output() {
        let p = Projection::parse("fetch.status").unwrap();
        assert_eq!(p.apply(&ctx()), json!("ok"));
    }

    #[test]
    fn missing_path_is_null() {
        let p = Projection::parse("fetch.status.deep.deeper").unwrap();
        assert_eq!(p.apply(&ctx()), Value::Null);
        let p = Projection::parse("nope").unwrap();
        assert_eq!(p.apply(&ctx()), Value::Null);
    }

    #[test]
    fn transforms() {
        assert_eq!(
            Projection::parse("bag.who | upper").unwrap().apply(&ctx()),
            json!("ADA")
        );
        assert_eq!(
            Projection::parse("bag.n | length").unwrap().apply(&ctx()),
            json!(3)
        );
        assert_eq!(
            Projection::parse("bag.n | upper").unwrap().apply(&ctx()),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Projection::parse("a | shout"),
            Err(ProjectionError::UnknownTransform(_))
        ));
        assert!(matches!(
            Projection::parse("a..b"),
            Err(ProjectionError::EmptySegment(_))
        ));
        assert!(matches!(
            Projection::parse("a.b c"),
            Err(ProjectionError::BadSegment(_))
        ));
        assert!(matches!(
            Projection::parse("a | upper | lower"),
            Err(ProjectionError::MultipleTransforms(_))
        ));
    }

    #[test]
    fn approval_lands_in_bag() {
        let mut c = ctx();
        c.set_bag_entry("ops_ok", json!(true));
        assert_eq!(c.bag()["ops_ok"], json!(true));
        // Existing bag content survives.
        assert_eq!(c.bag()["who"], json!("ada"));
    }

    #[test]
    fn context_value_round_trip() {
        let c = ctx();
        let restored = RunContext::from_value(c.to_value());
        assert_eq!(restored, c);
    }
}
