use std::sync::Arc;

use crate::array::Buffer;
use crate::meta::Metadata;
use crate::roi::Shape;

/// Literal value held by an input slot or published by a value-type output.
///
/// Arrays are shared, never copied, when a value is handed between slots.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Shape(Shape),
    Array(Arc<Buffer>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Shape(_) => "shape",
            Value::Array(_) => "array",
        }
    }

    /// Metadata a slot takes on when it holds this value.
    pub fn meta(&self) -> Metadata {
        match self {
            Value::Array(buf) => Metadata::array(buf.dtype(), buf.shape()),
            other => Metadata::scalar(other.kind()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_shape(&self) -> Option<&[usize]> {
        match self {
            Value::Shape(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<Buffer>> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Shape> for Value {
    fn from(v: Shape) -> Self {
        Value::Shape(v)
    }
}

impl From<Buffer> for Value {
    fn from(v: Buffer) -> Self {
        Value::Array(Arc::new(v))
    }
}
