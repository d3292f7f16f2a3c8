//! Conversion between native values and script values

use std::collections::BTreeMap;
use std::time::Duration;

use rhai::{Array, Blob, Dynamic, INT, Map};

use crate::error::RunError;

/// Native view of a script value
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Unit,
    Text(String),
    Bytes(Vec<u8>),
    Int(i64),
    Float(f64),
    Bool(bool),
    Struct(BTreeMap<String, ScriptValue>),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Text when `bytes` is valid UTF-8, a blob otherwise
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => ScriptValue::Text(text),
            Err(e) => ScriptValue::Bytes(e.into_bytes()),
        }
    }

    /// Convert parsed JSON; integers that fit stay integers
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Unit,
            serde_json::Value::Bool(b) => ScriptValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptValue::Int(i),
                None => ScriptValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ScriptValue::Text(s),
            serde_json::Value::Array(items) => {
                ScriptValue::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(fields) => ScriptValue::Struct(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON for request bodies; blobs become arrays of numbers
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScriptValue::Unit => serde_json::Value::Null,
            ScriptValue::Text(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Bytes(b) => b.iter().map(|&x| serde_json::Value::from(x)).collect(),
            ScriptValue::Int(i) => serde_json::Value::from(*i),
            ScriptValue::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Struct(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            ScriptValue::Array(items) => items.iter().map(Self::to_json).collect(),
        }
    }

    /// Type name used in error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Unit => "unit",
            ScriptValue::Text(_) => "string",
            ScriptValue::Bytes(_) => "blob",
            ScriptValue::Int(_) => "int",
            ScriptValue::Float(_) => "float",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Struct(_) => "map",
            ScriptValue::Array(_) => "array",
        }
    }

    /// Convert into an engine value
    #[must_use]
    pub fn into_dynamic(self) -> Dynamic {
        match self {
            ScriptValue::Unit => Dynamic::UNIT,
            ScriptValue::Text(s) => s.into(),
            ScriptValue::Bytes(b) => Dynamic::from_blob(b),
            ScriptValue::Int(i) => Dynamic::from_int(i),
            ScriptValue::Float(f) => Dynamic::from_float(f),
            ScriptValue::Bool(b) => Dynamic::from_bool(b),
            ScriptValue::Struct(fields) => {
                let map: Map = fields
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into_dynamic()))
                    .collect();
                Dynamic::from_map(map)
            }
            ScriptValue::Array(items) => {
                let array: Array = items.into_iter().map(Self::into_dynamic).collect();
                Dynamic::from_array(array)
            }
        }
    }

    /// Convert an engine value
    ///
    /// # Errors
    /// Returns `RunError::Type` for values with no native counterpart
    /// (function pointers, custom types).
    pub fn from_dynamic(value: &Dynamic) -> Result<Self, RunError> {
        if value.is_unit() {
            return Ok(ScriptValue::Unit);
        }
        if let Ok(i) = value.as_int() {
            return Ok(ScriptValue::Int(i));
        }
        if let Ok(f) = value.as_float() {
            return Ok(ScriptValue::Float(f));
        }
        if let Ok(b) = value.as_bool() {
            return Ok(ScriptValue::Bool(b));
        }
        if value.is_string() || value.is_char() {
            return Ok(ScriptValue::Text(value.to_string()));
        }
        if let Some(blob) = value.read_lock::<Blob>() {
            return Ok(ScriptValue::Bytes(blob.clone()));
        }
        if let Some(array) = value.read_lock::<Array>() {
            return array
                .iter()
                .map(Self::from_dynamic)
                .collect::<Result<_, _>>()
                .map(ScriptValue::Array);
        }
        if let Some(map) = value.read_lock::<Map>() {
            return map
                .iter()
                .map(|(k, v)| Ok((k.to_string(), Self::from_dynamic(v)?)))
                .collect::<Result<_, RunError>>()
                .map(ScriptValue::Struct);
        }
        Err(RunError::Type(format!(
            "unsupported value of type {}",
            value.type_name()
        )))
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::Text(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Text(value.to_string())
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Int(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl<T: Into<ScriptValue>> From<Vec<T>> for ScriptValue {
    fn from(items: Vec<T>) -> Self {
        ScriptValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ScriptValue>> From<Option<T>> for ScriptValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ScriptValue::Unit, Into::into)
    }
}

/// Builder for struct results returned to scripts
#[derive(Debug, Default)]
pub(crate) struct StructBuilder(BTreeMap<String, ScriptValue>);

impl StructBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn field(mut self, name: &str, value: impl Into<ScriptValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub(crate) fn build(self) -> Dynamic {
        ScriptValue::Struct(self.0).into_dynamic()
    }
}

/// Typed reader over a script map
///
/// Unknown fields are ignored, missing or unit fields read as `None`, and a
/// field of the wrong type is a `RunError::Type` naming it.
#[derive(Debug)]
pub struct Fields<'a> {
    context: &'a str,
    map: &'a Map,
}

impl<'a> Fields<'a> {
    /// Read fields of `map`; `context` prefixes error messages
    #[must_use]
    pub fn new(context: &'a str, map: &'a Map) -> Self {
        Self { context, map }
    }

    fn get(&self, field: &str) -> Option<&'a Dynamic> {
        self.map.get(field).filter(|v| !v.is_unit())
    }

    fn mismatch(&self, field: &str, expected: &str, found: &Dynamic) -> RunError {
        RunError::Type(format!(
            "{}.{field}: expected {expected}, found {}",
            self.context,
            found.type_name()
        ))
    }

    /// String field; an empty string reads as unset
    ///
    /// # Errors
    /// Returns `RunError::Type` when the field is not a string.
    pub fn string(&self, field: &str) -> Result<Option<String>, RunError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) if v.is_string() => {
                let s = v.to_string();
                Ok((!s.is_empty()).then_some(s))
            }
            Some(v) => Err(self.mismatch(field, "string", v)),
        }
    }

    /// Boolean field
    ///
    /// # Errors
    /// Returns `RunError::Type` when the field is not a bool.
    pub fn bool(&self, field: &str) -> Result<Option<bool>, RunError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .map_err(|_| self.mismatch(field, "bool", v)),
        }
    }

    /// Integer field
    ///
    /// # Errors
    /// Returns `RunError::Type` when the field is not an int.
    pub fn int(&self, field: &str) -> Result<Option<INT>, RunError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_int()
                .map(Some)
                .map_err(|_| self.mismatch(field, "int", v)),
        }
    }

    /// Duration in seconds, integer or fractional; zero reads as unset
    ///
    /// # Errors
    /// Returns `RunError::Type` for non-numeric, negative or out-of-range values.
    pub fn seconds(&self, field: &str) -> Result<Option<Duration>, RunError> {
        let Some(v) = self.get(field) else {
            return Ok(None);
        };
        let secs = match (v.as_int(), v.as_float()) {
            #[allow(clippy::cast_precision_loss)]
            (Ok(i), _) => i as f64,
            (_, Ok(f)) => f,
            _ => return Err(self.mismatch(field, "number of seconds", v)),
        };
        if !secs.is_finite() || secs < 0.0 {
            return Err(RunError::Type(format!(
                "{}.{field}: expected a non-negative number of seconds, found {secs}",
                self.context
            )));
        }
        if secs <= 0.0 {
            return Ok(None);
        }
        Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            RunError::Type(format!(
                "{}.{field}: {secs} seconds is out of range",
                self.context
            ))
        })
    }

    /// Array of strings; a single string reads as a one-element array
    ///
    /// # Errors
    /// Returns `RunError::Type` when the field or an element is not a string.
    pub fn strings(&self, field: &str) -> Result<Vec<String>, RunError> {
        match self.get(field) {
            None => Ok(Vec::new()),
            Some(v) if v.is_string() => Ok(vec![v.to_string()]),
            Some(v) => match v.read_lock::<Array>() {
                Some(items) => items
                    .iter()
                    .map(|item| {
                        if item.is_string() {
                            Ok(item.to_string())
                        } else {
                            Err(self.mismatch(field, "array of strings", item))
                        }
                    })
                    .collect(),
                None => Err(self.mismatch(field, "array of strings", v)),
            },
        }
    }

    /// Nested map field
    ///
    /// # Errors
    /// Returns `RunError::Type` when the field is not a map.
    pub fn map(&self, field: &str) -> Result<Option<Map>, RunError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .read_lock::<Map>()
                .map(|m| Some(m.clone()))
                .ok_or_else(|| self.mismatch(field, "map", v)),
        }
    }

    /// Field of any type
    #[must_use]
    pub fn raw(&self, field: &str) -> Option<&'a Dynamic> {
        self.get(field)
    }

    /// Name of the map being read
    #[must_use]
    pub fn context(&self) -> &str {
        self.context
    }
}

/// Native option struct read from a script map
pub trait FromScript: Sized {
    /// Read `map`; `context` names the operation in error messages
    ///
    /// # Errors
    /// Returns `RunError::Type` for mistyped fields.
    fn from_script(context: &str, map: &Map) -> Result<Self, RunError>;
}

/// Entries of a map whose values must all be strings
///
/// # Errors
/// Returns `RunError::Type` naming `context.field.key` for a non-string value.
pub fn string_entries(
    context: &str,
    field: &str,
    map: &Map,
) -> Result<Vec<(String, String)>, RunError> {
    map.iter()
        .map(|(k, v)| {
            v.clone()
                .into_immutable_string()
                .map(|value| (k.to_string(), value.to_string()))
                .map_err(|actual| {
                    RunError::Type(format!(
                        "{context}.{field}.{k}: expected string, found {actual}"
                    ))
                })
        })
        .collect()
}

/// Environment entries given as `["K=V", ...]` or `#{K: "V"}`
///
/// # Errors
/// Returns `RunError::Type` for other shapes and `RunError::Configuration`
/// for array entries without `=`.
pub fn env_entries(context: &str, value: &Dynamic) -> Result<Vec<(String, String)>, RunError> {
    if let Some(map) = value.read_lock::<Map>() {
        return string_entries(context, "env", &map);
    }
    if let Some(items) = value.read_lock::<Array>() {
        return items
            .iter()
            .map(|item| {
                let entry = item.clone().into_immutable_string().map_err(|actual| {
                    RunError::Type(format!(
                        "{context}.env: expected \"KEY=VALUE\" string, found {actual}"
                    ))
                })?;
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        RunError::Configuration(format!(
                            "{context}.env: entry {entry:?} is not KEY=VALUE"
                        ))
                    })
            })
            .collect();
    }
    Err(RunError::Type(format!(
        "{context}.env: expected array or map, found {}",
        value.type_name()
    )))
}
