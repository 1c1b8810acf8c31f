use crate::{AdapterError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use std::fmt;
use uuid::Uuid;

/// Opaque reference to a callable on the other side of the boundary.
/// Not guaranteed to be invocable from another language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRef {
    pub id: Uuid,
    pub name: String,
}

impl FunctionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub component_id: String,
}

/// Language-neutral value crossing the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaggedValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<TaggedValue>),
    Object(Vec<(String, TaggedValue)>),
    Function(FunctionRef),
    Component(ComponentRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Null,
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    Bytes,
    Array,
    Object,
    Function,
    Component,
    Any,
}

impl ValueType {
    /// Int32 widens into Int64; `Any` accepts everything.
    pub fn accepts(self, found: ValueType) -> bool {
        self == ValueType::Any || self == found || (self == ValueType::Int64 && found == ValueType::Int32)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Float64 => "float64",
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Function => "function",
            ValueType::Component => "component",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

impl TaggedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TaggedValue::Null => ValueType::Null,
            TaggedValue::Bool(_) => ValueType::Bool,
            TaggedValue::Int32(_) => ValueType::Int32,
            TaggedValue::Int64(_) => ValueType::Int64,
            TaggedValue::Float64(_) => ValueType::Float64,
            TaggedValue::String(_) => ValueType::String,
            TaggedValue::Bytes(_) => ValueType::Bytes,
            TaggedValue::Array(_) => ValueType::Array,
            TaggedValue::Object(_) => ValueType::Object,
            TaggedValue::Function(_) => ValueType::Function,
            TaggedValue::Component(_) => ValueType::Component,
        }
    }

    /// Picks Int32 when the value fits, Int64 otherwise.
    pub fn integer(value: i64) -> Self {
        match i32::try_from(value) {
            Ok(small) => TaggedValue::Int32(small),
            Err(_) => TaggedValue::Int64(value),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TaggedValue::Int32(v) => Some(i64::from(*v)),
            TaggedValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TaggedValue::Float64(v) => Some(*v),
            TaggedValue::Int32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaggedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&TaggedValue> {
        match self {
            TaggedValue::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Approximate in-memory size in bytes, used for memory accounting.
    pub fn footprint(&self) -> u64 {
        let own = std::mem::size_of::<TaggedValue>() as u64;
        let heap = match self {
            TaggedValue::String(s) => s.len() as u64,
            TaggedValue::Bytes(b) => b.len() as u64,
            TaggedValue::Array(items) => items.iter().map(TaggedValue::footprint).sum(),
            TaggedValue::Object(entries) => entries
                .iter()
                .map(|(k, v)| k.len() as u64 + v.footprint())
                .sum(),
            TaggedValue::Function(f) => f.name.len() as u64,
            TaggedValue::Component(c) => c.component_id.len() as u64,
            _ => 0,
        };
        own + heap
    }

    fn mismatch(&self, expected: &str) -> AdapterError {
        AdapterError::Marshal {
            expected: expected.to_string(),
            found: self.value_type().to_string(),
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggedValue::Null => f.write_str("null"),
            TaggedValue::Bool(b) => write!(f, "{}", b),
            TaggedValue::Int32(v) => write!(f, "{}", v),
            TaggedValue::Int64(v) => write!(f, "{}", v),
            TaggedValue::Float64(v) => write!(f, "{}", v),
            TaggedValue::String(s) => write!(f, "{:?}", s),
            TaggedValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            TaggedValue::Array(items) => write!(f, "<array of {}>", items.len()),
            TaggedValue::Object(entries) => write!(f, "<object of {}>", entries.len()),
            TaggedValue::Function(func) => write!(f, "<function {}>", func.name),
            TaggedValue::Component(c) => write!(f, "<component {}>", c.component_id),
        }
    }
}

/// Conversion between a native Rust value and its neutral form.
pub trait Marshal: Sized {
    fn to_neutral(&self) -> TaggedValue;
    fn from_neutral(value: &TaggedValue) -> Result<Self>;
}

pub fn to_neutral<T: Marshal>(value: &T) -> TaggedValue {
    value.to_neutral()
}

pub fn from_neutral<T: Marshal>(value: &TaggedValue) -> Result<T> {
    T::from_neutral(value)
}

impl Marshal for TaggedValue {
    fn to_neutral(&self) -> TaggedValue {
        self.clone()
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl Marshal for () {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::Null
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        match value {
            TaggedValue::Null => Ok(()),
            other => Err(other.mismatch("null")),
        }
    }
}

impl Marshal for bool {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::Bool(*self)
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        match value {
            TaggedValue::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }
}

impl Marshal for i32 {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::Int32(*self)
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| value.mismatch("int32"))
    }
}

impl Marshal for u32 {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::integer(i64::from(*self))
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| value.mismatch("uint32"))
    }
}

impl Marshal for i64 {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::integer(*self)
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        value.as_i64().ok_or_else(|| value.mismatch("int64"))
    }
}

impl Marshal for f64 {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::Float64(*self)
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        value.as_f64().ok_or_else(|| value.mismatch("float64"))
    }
}

impl Marshal for String {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::String(self.clone())
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| value.mismatch("string"))
    }
}

impl Marshal for Bytes {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::Bytes(self.clone())
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        match value {
            TaggedValue::Bytes(b) => Ok(b.clone()),
            other => Err(other.mismatch("bytes")),
        }
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn to_neutral(&self) -> TaggedValue {
        TaggedValue::Array(self.iter().map(Marshal::to_neutral).collect())
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        match value {
            TaggedValue::Array(items) => items.iter().map(T::from_neutral).collect(),
            other => Err(other.mismatch("array")),
        }
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn to_neutral(&self) -> TaggedValue {
        match self {
            Some(v) => v.to_neutral(),
            None => TaggedValue::Null,
        }
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        match value {
            TaggedValue::Null => Ok(None),
            other => T::from_neutral(other).map(Some),
        }
    }
}

/// JSON is the dynamically typed host form. Inference order:
/// null, bool, integer, float, string, array, object.
impl Marshal for JsonValue {
    fn to_neutral(&self) -> TaggedValue {
        match self {
            JsonValue::Null => TaggedValue::Null,
            JsonValue::Bool(b) => TaggedValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TaggedValue::integer(i)
                } else if let Some(u) = n.as_u64() {
                    // Above i64::MAX; only representable as a float
                    TaggedValue::Float64(u as f64)
                } else {
                    TaggedValue::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => TaggedValue::String(s.clone()),
            JsonValue::Array(items) => TaggedValue::Array(items.iter().map(Marshal::to_neutral).collect()),
            JsonValue::Object(map) => {
                if let Some(reference) = reference_from_json(map) {
                    return reference;
                }
                TaggedValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), v.to_neutral()))
                        .collect(),
                )
            }
        }
    }

    fn from_neutral(value: &TaggedValue) -> Result<Self> {
        Ok(match value {
            TaggedValue::Null => JsonValue::Null,
            TaggedValue::Bool(b) => JsonValue::Bool(*b),
            TaggedValue::Int32(v) => JsonValue::from(*v),
            TaggedValue::Int64(v) => JsonValue::from(*v),
            TaggedValue::Float64(v) => Number::from_f64(*v)
                .map(JsonValue::Number)
                .ok_or_else(|| value.mismatch("finite json number"))?,
            TaggedValue::String(s) => JsonValue::String(s.clone()),
            TaggedValue::Bytes(b) => JsonValue::Array(b.iter().map(|byte| JsonValue::from(*byte)).collect()),
            TaggedValue::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(JsonValue::from_neutral)
                    .collect::<Result<Vec<_>>>()?,
            ),
            TaggedValue::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), JsonValue::from_neutral(v)?);
                }
                JsonValue::Object(map)
            }
            TaggedValue::Function(func) => serde_json::json!({
                "$ref": "function",
                "id": func.id.to_string(),
                "name": func.name,
            }),
            TaggedValue::Component(c) => serde_json::json!({
                "$ref": "component",
                "component_id": c.component_id,
            }),
        })
    }
}

/// Only objects with exactly the key set `from_neutral` emits decode as
/// references; anything else is user data that happens to carry `$ref`.
fn reference_from_json(map: &Map<String, JsonValue>) -> Option<TaggedValue> {
    let kind = map.get("$ref")?.as_str()?;
    let keys: &[&str] = match kind {
        "function" => &["$ref", "id", "name"],
        "component" => &["$ref", "component_id"],
        _ => return None,
    };
    if map.len() != keys.len() || !keys.iter().all(|k| map.contains_key(*k)) {
        return None;
    }

    match kind {
        "function" => {
            let id = map.get("id")?.as_str()?.parse().ok()?;
            let name = map.get("name")?.as_str()?.to_string();
            Some(TaggedValue::Function(FunctionRef { id, name }))
        }
        "component" => {
            let component_id = map.get("component_id")?.as_str()?.to_string();
            Some(TaggedValue::Component(ComponentRef { component_id }))
        }
        _ => None,
    }
}

macro_rules! impl_from_native {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for TaggedValue {
                fn from(value: $ty) -> Self {
                    value.to_neutral()
                }
            }
        )*
    };
}

impl_from_native!(bool, i32, u32, i64, f64, String, Bytes, JsonValue);

impl From<&str> for TaggedValue {
    fn from(value: &str) -> Self {
        TaggedValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for TaggedValue {
    fn from(value: Vec<u8>) -> Self {
        TaggedValue::Bytes(Bytes::from(value))
    }
}
