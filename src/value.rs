//! Dynamic values exchanged between the SOAP engine and service providers.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A decoded SOAP value.
///
/// The engine decodes envelope elements into this model, binding wrappers
/// pass it to providers unchanged, and provider results are serialized back
/// from it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SoapValue {
    /// `xsi:nil` or an absent result
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    /// `xsd:base64Binary`
    Bytes(Vec<u8>),
    /// `xsd:dateTime`
    DateTime(DateTime<FixedOffset>),
    Array(Vec<SoapValue>),
    Struct(SoapStruct),
}

/// An ordered set of named fields, optionally tagged with the native type
/// it was mapped to through the class map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SoapStruct {
    /// Native type identifier resolved from the class map
    pub type_name: Option<String>,
    /// Fields in document order
    pub fields: Vec<(String, SoapValue)>,
}

impl SoapStruct {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a struct tagged with a native type name.
    pub fn typed(type_name: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            fields: Vec::new(),
        }
    }

    /// Append a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<SoapValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: SoapValue) {
        self.fields.push((name.into(), value));
    }

    /// First field with the given name.
    pub fn get(&self, name: &str) -> Option<&SoapValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field values in order, dropping the names.
    pub fn into_values(self) -> Vec<SoapValue> {
        self.fields.into_iter().map(|(_, v)| v).collect()
    }
}

impl SoapValue {
    /// Single-entry struct, the shape document-style responses use.
    pub fn single(name: impl Into<String>, value: SoapValue) -> Self {
        SoapValue::Struct(SoapStruct {
            type_name: None,
            fields: vec![(name.into(), value)],
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SoapValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SoapValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted since untyped envelopes
    /// carry everything as text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SoapValue::Int(i) => Some(*i),
            SoapValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SoapValue::Double(d) => Some(*d),
            SoapValue::Int(i) => Some(*i as f64),
            SoapValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SoapValue::Bool(b) => Some(*b),
            SoapValue::String(s) => match s.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&SoapStruct> {
        match self {
            SoapValue::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Native type name of a class-mapped struct.
    pub fn type_name(&self) -> Option<&str> {
        self.as_struct().and_then(|s| s.type_name.as_deref())
    }

    /// Convert into a JSON value. Bytes become base64 text and dates
    /// RFC 3339 text; struct type tags are dropped.
    pub fn into_json(self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            SoapValue::Null => Value::Null,
            SoapValue::Bool(b) => Value::Bool(b),
            SoapValue::Int(i) => Value::from(i),
            SoapValue::Double(d) => serde_json::Number::from_f64(d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SoapValue::String(s) => Value::String(s),
            SoapValue::Bytes(b) => Value::String(STANDARD.encode(b)),
            SoapValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
            SoapValue::Array(items) => {
                Value::Array(items.into_iter().map(SoapValue::into_json).collect())
            }
            SoapValue::Struct(s) => Value::Object(
                s.fields
                    .into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => SoapValue::Null,
            Value::Bool(b) => SoapValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SoapValue::Int(i),
                None => SoapValue::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SoapValue::String(s),
            Value::Array(items) => {
                SoapValue::Array(items.into_iter().map(SoapValue::from_json).collect())
            }
            Value::Object(map) => SoapValue::Struct(SoapStruct {
                type_name: None,
                fields: map
                    .into_iter()
                    .map(|(k, v)| (k, SoapValue::from_json(v)))
                    .collect(),
            }),
        }
    }

    /// Deserialize into a native type through the JSON bridge.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.clone().into_json())
    }

    /// Serialize a native value into a SOAP value.
    pub fn serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(SoapValue::from_json)
    }
}

impl From<bool> for SoapValue {
    fn from(v: bool) -> Self {
        SoapValue::Bool(v)
    }
}

impl From<i64> for SoapValue {
    fn from(v: i64) -> Self {
        SoapValue::Int(v)
    }
}

impl From<i32> for SoapValue {
    fn from(v: i32) -> Self {
        SoapValue::Int(v as i64)
    }
}

impl From<f64> for SoapValue {
    fn from(v: f64) -> Self {
        SoapValue::Double(v)
    }
}

impl From<String> for SoapValue {
    fn from(v: String) -> Self {
        SoapValue::String(v)
    }
}

impl From<&str> for SoapValue {
    fn from(v: &str) -> Self {
        SoapValue::String(v.to_string())
    }
}

impl From<Vec<SoapValue>> for SoapValue {
    fn from(v: Vec<SoapValue>) -> Self {
        SoapValue::Array(v)
    }
}

impl From<SoapStruct> for SoapValue {
    fn from(v: SoapStruct) -> Self {
        SoapValue::Struct(v)
    }
}

impl<T: Into<SoapValue>> From<Option<T>> for SoapValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SoapValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: i64,
        customer: String,
    }

    #[test]
    fn test_struct_lookup() {
        let s = SoapStruct::new()
            .with_field("id", 7)
            .with_field("customer", "acme");
        assert_eq!(s.get("id"), Some(&SoapValue::Int(7)));
        assert!(s.get("missing").is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_deserialize_struct() {
        let value = SoapValue::Struct(
            SoapStruct::typed("Order")
                .with_field("id", 42)
                .with_field("customer", "acme"),
        );
        let order: Order = value.deserialize().unwrap();
        assert_eq!(
            order,
            Order {
                id: 42,
                customer: "acme".to_string()
            }
        );
        assert_eq!(value.type_name(), Some("Order"));
    }

    #[test]
    fn test_bytes_become_base64_json() {
        let json = SoapValue::Bytes(b"hello".to_vec()).into_json();
        assert_eq!(json, serde_json::Value::String("aGVsbG8=".to_string()));
    }

    #[test]
    fn test_textual_numbers() {
        assert_eq!(SoapValue::from("12").as_i64(), Some(12));
        assert_eq!(SoapValue::from(" 2.5 ").as_f64(), Some(2.5));
        assert_eq!(SoapValue::from("true").as_bool(), Some(true));
        assert_eq!(SoapValue::from("maybe").as_bool(), None);
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert!(SoapValue::from(none).is_null());
        assert_eq!(SoapValue::from(Some("x")), SoapValue::String("x".into()));
    }
}
