//! Conversion between host values and script values.
//!
//! [`Value`] is the host-side mirror of a script value. It keeps the
//! distinction between "not provided" (`Undefined`, or an absent object key)
//! and "explicitly empty" (`""`, `[]`, `{}`), carries binary data as
//! [`Value::Bytes`] so raw `.torrent` payloads and cipher output survive the
//! boundary, and preserves the key order of script objects.

use std::fmt;

use indexmap::IndexMap;
use rquickjs::{Array, ArrayBuffer, Ctx, FromJs, IntoJs, Object, Type, TypedArray};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Script values nested deeper than this are rejected (this also stops cycles).
const MAX_DEPTH: usize = 64;

/// Upper bound on values visited while reading one result. Shared
/// sub-objects are counted once per path that reaches them.
const MAX_NODES: usize = 100_000;

/// Upper bound on string and byte payload read from one result.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Conversion failure attached to the offending field path (`$.results[2].title`).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{path}: {message}")]
pub struct MarshalError {
    pub path: String,
    pub message: String,
}

impl MarshalError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A script value in host form.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    /// `undefined` on the script side; the host's "not provided".
    pub fn is_unset(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// `undefined` or `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Object member lookup. Missing keys and non-objects read as `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Short type name used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// JSON view of the value.
    ///
    /// Unset object members are dropped, unset array slots become `null`,
    /// bytes become arrays of numbers and non-finite numbers become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .filter(|(_, v)| !v.is_unset())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert any serializable host value. `None` fields skipped by serde
    /// stay absent; the rest arrive as `null`.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, MarshalError> {
        serde_json::to_value(value)
            .map(Value::from)
            .map_err(|e| MarshalError::new("$", e.to_string()))
    }

    /// Decode into a typed host structure, reporting the failing field path.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, MarshalError> {
        serde_path_to_error::deserialize(self.to_json()).map_err(|err| {
            let path = json_path(&err.path().to_string());
            MarshalError::new(path, err.into_inner().to_string())
        })
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// `results[0].title` → `$.results[0].title`, `.` → `$`.
fn json_path(raw: &str) -> String {
    if raw == "." || raw.is_empty() {
        "$".to_string()
    } else if raw.starts_with('[') {
        format!("${raw}")
    } else {
        format!("$.{raw}")
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// ─── Script side ────────────────────────────────────────────────────────

/// Build the script value for `value` inside `ctx`.
pub(crate) fn to_js<'js>(ctx: &Ctx<'js>, value: &Value) -> rquickjs::Result<rquickjs::Value<'js>> {
    match value {
        Value::Undefined => rquickjs::Undefined.into_js(ctx),
        Value::Null => rquickjs::Null.into_js(ctx),
        Value::Bool(b) => b.into_js(ctx),
        Value::Number(n) => n.into_js(ctx),
        Value::String(s) => s.as_str().into_js(ctx),
        Value::Bytes(bytes) => TypedArray::<u8>::new(ctx.clone(), bytes.clone())?.into_js(ctx),
        Value::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, to_js(ctx, item)?)?;
            }
            array.into_js(ctx)
        }
        Value::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                if item.is_unset() {
                    continue;
                }
                object.set(key.as_str(), to_js(ctx, item)?)?;
            }
            object.into_js(ctx)
        }
    }
}

/// Read a settled script value back into host form.
///
/// Runs outside the interrupt deadline, so the walk is bounded by
/// [`MAX_NODES`] and [`MAX_PAYLOAD_BYTES`] as well as [`MAX_DEPTH`].
pub(crate) fn from_js<'js>(
    ctx: &Ctx<'js>,
    value: &rquickjs::Value<'js>,
) -> Result<Value, MarshalError> {
    Reader::default().read(ctx, value, "$", 0)
}

#[derive(Debug, Default)]
struct Reader {
    nodes: usize,
    payload: usize,
}

impl Reader {
    fn charge(&mut self, path: &str, payload: usize) -> Result<(), MarshalError> {
        self.nodes += 1;
        self.payload = self.payload.saturating_add(payload);
        if self.nodes > MAX_NODES {
            return Err(MarshalError::new(
                path,
                format!("value has more than {MAX_NODES} elements"),
            ));
        }
        if self.payload > MAX_PAYLOAD_BYTES {
            return Err(MarshalError::new(
                path,
                format!("value carries more than {MAX_PAYLOAD_BYTES} bytes of data"),
            ));
        }
        Ok(())
    }

    fn read<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        value: &rquickjs::Value<'js>,
        path: &str,
        depth: usize,
    ) -> Result<Value, MarshalError> {
        if depth > MAX_DEPTH {
            return Err(MarshalError::new(
                path,
                "value is nested too deeply or contains a cycle",
            ));
        }
        self.charge(path, 0)?;

        let js_err = |e: rquickjs::Error| MarshalError::new(path, e.to_string());

        match value.type_of() {
            Type::Uninitialized | Type::Undefined => Ok(Value::Undefined),
            Type::Null => Ok(Value::Null),
            Type::Bool => Ok(Value::Bool(value.as_bool().unwrap_or_default())),
            Type::Int => Ok(Value::Number(f64::from(value.as_int().unwrap_or_default()))),
            Type::Float => Ok(Value::Number(value.as_float().unwrap_or(f64::NAN))),
            Type::String => {
                let text = value
                    .as_string()
                    .ok_or_else(|| MarshalError::new(path, "expected a string"))?
                    .to_string()
                    .map_err(js_err)?;
                self.charge(path, text.len())?;
                Ok(Value::String(text))
            }
            Type::Array => {
                let array = value
                    .as_array()
                    .ok_or_else(|| MarshalError::new(path, "expected an array"))?;
                let mut items = Vec::with_capacity(array.len().min(MAX_NODES));
                for (index, item) in array.iter::<rquickjs::Value>().enumerate() {
                    let item = item.map_err(js_err)?;
                    let child = format!("{path}[{index}]");
                    items.push(self.read(ctx, &item, &child, depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            Type::Function | Type::Constructor => Ok(Value::Undefined),
            Type::Promise => Err(MarshalError::new(
                path,
                "unsettled promise cannot cross the boundary",
            )),
            Type::Symbol => Err(MarshalError::new(path, "symbols are not supported")),
            Type::Object | Type::Exception => {
                if let Ok(typed) = TypedArray::<u8>::from_js(ctx, value.clone()) {
                    let bytes = typed.as_bytes().unwrap_or_default();
                    self.charge(path, bytes.len())?;
                    return Ok(Value::Bytes(bytes.to_vec()));
                }
                if let Ok(buffer) = ArrayBuffer::from_js(ctx, value.clone()) {
                    let bytes = buffer.as_bytes().unwrap_or_default();
                    self.charge(path, bytes.len())?;
                    return Ok(Value::Bytes(bytes.to_vec()));
                }
                let object = value
                    .as_object()
                    .ok_or_else(|| MarshalError::new(path, "expected an object"))?;
                let mut map = IndexMap::new();
                for prop in object.props::<String, rquickjs::Value>() {
                    let (key, item) = prop.map_err(js_err)?;
                    let child = format!("{path}.{key}");
                    let converted = self.read(ctx, &item, &child, depth + 1)?;
                    if !converted.is_unset() {
                        map.insert(key, converted);
                    }
                }
                Ok(Value::Object(map))
            }
            other => Err(MarshalError::new(
                path,
                format!("unsupported script value of type {other:?}"),
            )),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
