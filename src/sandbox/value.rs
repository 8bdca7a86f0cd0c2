//! Runtime values for the sandbox evaluator.
//!
//! Values are JSON-shaped plus program-local functions. Lists and mappings
//! use shared interior mutability so aliasing behaves the way the scripting
//! surface implies (`b = a; b[0] = 1` is visible through `a`). The
//! interpreter is single-threaded, so `Rc<RefCell<...>>` is sufficient.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

use super::ast::FuncDef;

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type MapRef = Rc<RefCell<BTreeMap<String, Value>>>;

/// Built-in callables bindable in the sandbox environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Range,
    Enumerate,
    Min,
    Max,
    Sum,
    Sorted,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    LlmQuery,
    Final,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Range => "range",
            Self::Enumerate => "enumerate",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Sorted => "sorted",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
            Self::LlmQuery => "llm_query",
            Self::Final => "FINAL",
        }
    }

    /// Every builtin, for environment seeding.
    pub fn all() -> &'static [Builtin] {
        &[
            Self::Len,
            Self::Range,
            Self::Enumerate,
            Self::Min,
            Self::Max,
            Self::Sum,
            Self::Sorted,
            Self::Str,
            Self::Int,
            Self::Float,
            Self::Bool,
            Self::List,
            Self::Dict,
            Self::LlmQuery,
            Self::Final,
        ]
    }
}

/// A sandbox runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(ListRef),
    Map(MapRef),
    Func(Rc<FuncDef>),
    Builtin(Builtin),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "dict",
            Self::Func(_) => "function",
            Self::Builtin(_) => "builtin",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            Self::Map(entries) => !entries.borrow().is_empty(),
            Self::Func(_) | Self::Builtin(_) => true,
        }
    }

    /// Numeric view, for arithmetic and comparisons.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Ordering between comparable values: numbers with numbers, strings
    /// with strings.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_number()?, other.as_number()?);
                a.partial_cmp(&b)
            }
        }
    }

    /// Deep structural equality. Numbers compare across int/float.
    pub fn is_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_equal(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.is_equal(vb))
            }
            (Self::Func(a), Self::Func(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// The values produced by iterating this value: list elements, string
    /// characters, or mapping keys.
    pub fn iter_values(&self) -> Result<Vec<Value>> {
        match self {
            Self::List(items) => Ok(items.borrow().clone()),
            Self::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Self::Map(entries) => Ok(entries
                .borrow()
                .keys()
                .map(|k| Value::Str(k.clone()))
                .collect()),
            other => Err(Error::program_runtime(format!(
                "'{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    /// String form used by `str()` and `FINAL()`: strings pass through,
    /// everything else renders as JSON.
    pub fn stringify(&self) -> Result<String> {
        match self {
            Self::Str(s) => Ok(s.clone()),
            other => Ok(other.to_json()?.to_string()),
        }
    }

    /// Convert to a JSON value. Functions and non-finite floats have no
    /// JSON form.
    pub fn to_json(&self) -> Result<JsonValue> {
        match self {
            Self::Null => Ok(JsonValue::Null),
            Self::Bool(b) => Ok(JsonValue::Bool(*b)),
            Self::Int(n) => Ok(JsonValue::from(*n)),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| Error::program_runtime("cannot serialize non-finite float")),
            Self::Str(s) => Ok(JsonValue::String(s.clone())),
            Self::List(items) => {
                let values: Result<Vec<_>> = items.borrow().iter().map(|v| v.to_json()).collect();
                Ok(JsonValue::Array(values?))
            }
            Self::Map(entries) => {
                let mut out = serde_json::Map::new();
                for (key, value) in entries.borrow().iter() {
                    out.insert(key.clone(), value.to_json()?);
                }
                Ok(JsonValue::Object(out))
            }
            Self::Func(f) => Err(Error::program_runtime(format!(
                "cannot serialize function '{}'",
                f.name
            ))),
            Self::Builtin(b) => Err(Error::program_runtime(format!(
                "cannot serialize builtin '{}'",
                b.name()
            ))),
        }
    }

    /// Build a value from JSON (used to load session memory).
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Self::Str(s.clone()),
            JsonValue::Array(items) => Self::list(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(entries) => Self::map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Float(0.5).truthy());
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::list(vec![Value::Null]).truthy());
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(Value::Int(2).is_equal(&Value::Float(2.0)));
        assert!(!Value::Int(2).is_equal(&Value::Str("2".into())));
    }

    #[test]
    fn test_json_round_trip() {
        let json = json!({"count": 3, "names": ["a", "b"], "ok": true, "note": null});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_function_has_no_json_form() {
        let func = Value::Func(Rc::new(FuncDef {
            name: "f".into(),
            params: vec![],
            body: vec![],
        }));
        assert!(func.to_json().is_err());
    }

    #[test]
    fn test_aliasing_through_list_ref() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::List(items) = &b {
            items.borrow_mut().push(Value::Int(2));
        }
        if let Value::List(items) = &a {
            assert_eq!(items.borrow().len(), 2);
        }
    }

    #[test]
    fn test_stringify() {
        assert_eq!(Value::Str("plain".into()).stringify().unwrap(), "plain");
        assert_eq!(Value::Int(7).stringify().unwrap(), "7");
        assert_eq!(Value::Null.stringify().unwrap(), "null");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Int(2)])
                .stringify()
                .unwrap(),
            "[1,2]"
        );
    }
}
