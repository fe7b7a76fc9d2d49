// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Structural Patterns
//!
//! A [`Pattern`] is a predicate over a decoded [`Value`] plus the projection
//! that pulls named bindings out of a value once it matched. Map patterns
//! match on a subset of keys, sequence patterns on exact length.
//!
//! ```
//! use amqp_runtime::{pattern::Pattern, value::Value};
//! use serde_json::json;
//!
//! let pattern = Pattern::map([
//!     ("cmd", Pattern::eq("resize")),
//!     ("width", Pattern::bind("w", Pattern::number())),
//! ]);
//!
//! let value = Value::from(json!({"cmd": "resize", "width": 640, "extra": true}));
//! assert!(pattern.matches(&value));
//! assert_eq!(pattern.bindings(&value).get("w"), Some(&Value::Int(640)));
//! ```

use crate::value::{Value, ValueKind};
use std::{collections::HashMap, fmt, sync::Arc};

/// Values captured by `Pattern::Bind` during a match.
pub type Bindings = HashMap<String, Value>;

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A structural pattern over decoded payloads.
#[derive(Clone)]
pub enum Pattern {
    /// Matches anything.
    Any,
    /// Equal to the value (numbers compare by magnitude).
    Literal(Value),
    /// Any value of the given shape.
    Kind(ValueKind),
    /// A mapping containing at least these keys, each matching its pattern.
    Map(Vec<(String, Pattern)>),
    /// A sequence of exactly this length, element-wise.
    Seq(Vec<Pattern>),
    /// Matches the inner pattern and captures the value under a name.
    Bind(String, Box<Pattern>),
    /// Every pattern matches.
    All(Vec<Pattern>),
    /// Arbitrary test.
    Where(Predicate),
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => write!(f, "Any"),
            Pattern::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Pattern::Kind(k) => f.debug_tuple("Kind").field(k).finish(),
            Pattern::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Pattern::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            Pattern::Bind(name, inner) => f.debug_tuple("Bind").field(name).field(inner).finish(),
            Pattern::All(items) => f.debug_tuple("All").field(items).finish(),
            Pattern::Where(_) => write!(f, "Where(..)"),
        }
    }
}

impl Pattern {
    pub fn eq(value: impl Into<Value>) -> Pattern {
        Pattern::Literal(value.into())
    }

    pub fn string() -> Pattern {
        Pattern::Kind(ValueKind::String)
    }

    pub fn number() -> Pattern {
        Pattern::Kind(ValueKind::Number)
    }

    /// Raw bodies, i.e. anything the decoder left undecoded.
    pub fn bytes() -> Pattern {
        Pattern::Kind(ValueKind::Bytes)
    }

    pub fn map<K, I>(entries: I) -> Pattern
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Pattern)>,
    {
        Pattern::Map(entries.into_iter().map(|(k, p)| (k.into(), p)).collect())
    }

    pub fn seq(items: impl IntoIterator<Item = Pattern>) -> Pattern {
        Pattern::Seq(items.into_iter().collect())
    }

    pub fn bind(name: &str, inner: Pattern) -> Pattern {
        Pattern::Bind(name.to_owned(), Box::new(inner))
    }

    pub fn predicate<F>(test: F) -> Pattern
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Pattern::Where(Arc::new(test))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Literal(expected) => expected.loosely_eq(value),
            Pattern::Kind(kind) => value.kind() == *kind,
            Pattern::Map(entries) => {
                matches!(value, Value::Mapping(_))
                    && entries
                        .iter()
                        .all(|(key, p)| value.get(key).is_some_and(|v| p.matches(v)))
            }
            Pattern::Seq(items) => match value {
                Value::Sequence(values) => {
                    values.len() == items.len()
                        && items.iter().zip(values).all(|(p, v)| p.matches(v))
                }
                _ => false,
            },
            Pattern::Bind(_, inner) => inner.matches(value),
            Pattern::All(items) => items.iter().all(|p| p.matches(value)),
            Pattern::Where(test) => test(value),
        }
    }

    /// Collects the bindings of a value that `matches` accepted.
    pub fn bindings(&self, value: &Value) -> Bindings {
        let mut out = Bindings::new();
        self.collect(value, &mut out);
        out
    }

    fn collect(&self, value: &Value, out: &mut Bindings) {
        match self {
            Pattern::Bind(name, inner) => {
                out.insert(name.clone(), value.clone());
                inner.collect(value, out);
            }
            Pattern::Map(entries) => {
                for (key, p) in entries {
                    if let Some(v) = value.get(key) {
                        p.collect(v, out);
                    }
                }
            }
            Pattern::Seq(items) => {
                if let Value::Sequence(values) = value {
                    for (p, v) in items.iter().zip(values) {
                        p.collect(v, out);
                    }
                }
            }
            Pattern::All(items) => {
                for p in items {
                    p.collect(value, out);
                }
            }
            Pattern::Any | Pattern::Literal(_) | Pattern::Kind(_) | Pattern::Where(_) => {}
        }
    }
}
