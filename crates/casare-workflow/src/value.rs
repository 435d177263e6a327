//! Runtime values carried on data edges and stored in variables
//!
//! `Value` is the single payload type the engine moves between ports. The
//! JSON-representable subset converts losslessly to and from
//! `serde_json::Value`; resource references (`Handle`) exist only at runtime
//! and serialize as null.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::PortDataType;

/// An opaque reference to a shared runtime resource (browser, page,
/// database connection). The engine creates these; nodes pass them along
/// data edges without inspecting the inner payload.
#[derive(Clone)]
pub struct HandleValue {
    kind: PortDataType,
    inner: Arc<dyn Any + Send + Sync>,
}

impl HandleValue {
    pub fn new(kind: PortDataType, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self { kind, inner }
    }

    pub fn kind(&self) -> PortDataType {
        self.kind
    }

    /// Downcast the handle to its concrete resource type
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl fmt::Debug for HandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleValue({:?})", self.kind)
    }
}

impl PartialEq for HandleValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A runtime value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(HashMap<String, Value>),
    Binary(Vec<u8>),
    Handle(HandleValue),
}

impl Value {
    /// The port data type this value satisfies
    pub fn data_type(&self) -> PortDataType {
        match self {
            Value::Null => PortDataType::Any,
            Value::Bool(_) => PortDataType::Boolean,
            Value::Int(_) => PortDataType::Integer,
            Value::Float(_) => PortDataType::Float,
            Value::Str(_) => PortDataType::String,
            Value::List(_) => PortDataType::List,
            Value::Dict(_) => PortDataType::Dict,
            Value::Binary(_) => PortDataType::Binary,
            Value::Handle(h) => h.kind(),
        }
    }

    /// Truthiness used by conditions: null/false/0/empty are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false" && s != "0",
            Value::List(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Binary(b) => !b.is_empty(),
            Value::Handle(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Render the value for template interpolation
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::List(_) | Value::Dict(_) => {
                serde_json::to_string(&self.to_json()).unwrap_or_default()
            }
            Value::Binary(b) => format!("<{} bytes>", b.len()),
            Value::Handle(h) => format!("<{:?} handle>", h.kind()),
        }
    }

    /// Coerce this value to the given port type.
    ///
    /// Exact matches pass through; scalar conversions cover the
    /// string/number/boolean family. Returns `None` when no sensible
    /// conversion exists.
    pub fn coerce_to(&self, target: PortDataType) -> Option<Value> {
        if target == PortDataType::Any || self.data_type() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Str(s), PortDataType::Integer) => s.trim().parse().ok().map(Value::Int),
            (Value::Str(s), PortDataType::Float) => s.trim().parse().ok().map(Value::Float),
            (Value::Str(s), PortDataType::Boolean) => match s.trim() {
                "true" | "True" | "1" => Some(Value::Bool(true)),
                "false" | "False" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (Value::Int(i), PortDataType::Float) => Some(Value::Float(*i as f64)),
            (Value::Int(i), PortDataType::String) => Some(Value::Str(i.to_string())),
            (Value::Float(f), PortDataType::String) => Some(Value::Str(f.to_string())),
            (Value::Bool(b), PortDataType::String) => Some(Value::Str(b.to_string())),
            (Value::Float(f), PortDataType::Integer) if f.fract() == 0.0 => {
                Some(Value::Int(*f as i64))
            }
            _ => None,
        }
    }

    /// Convert to JSON. Handles and binary payloads have no JSON form and
    /// become null / byte arrays respectively.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Dict(d) => serde_json::Value::Object(
                d.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Binary(b) => {
                serde_json::Value::Array(b.iter().map(|x| serde_json::Value::from(*x)).collect())
            }
            Value::Handle(_) => serde_json::Value::Null,
        }
    }

    /// Build a value from JSON
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(a) => Value::List(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => Value::Dict(
                o.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({
            "name": "order-7",
            "count": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "ok": true,
            "missing": null
        });
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Str("false".into()).is_truthy());
        assert!(Value::Str("yes".into()).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn test_coercion() {
        assert_eq!(
            Value::Str("42".into()).coerce_to(PortDataType::Integer),
            Some(Value::Int(42))
        );
        assert_eq!(
            Value::Int(7).coerce_to(PortDataType::Float),
            Some(Value::Float(7.0))
        );
        assert_eq!(Value::Str("abc".into()).coerce_to(PortDataType::Integer), None);
        assert_eq!(
            Value::Float(2.5).coerce_to(PortDataType::Integer),
            None
        );
    }

    #[test]
    fn test_handle_identity() {
        let inner: Arc<dyn Any + Send + Sync> = Arc::new(17u32);
        let a = HandleValue::new(PortDataType::Browser, Arc::clone(&inner));
        let b = HandleValue::new(PortDataType::Browser, inner);
        assert_eq!(a, b);
        assert_eq!(a.downcast::<u32>().as_deref(), Some(&17));
        assert!(a.downcast::<String>().is_none());
    }
}
