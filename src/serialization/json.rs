//! JSON codec for the value tree.

use super::Serializer;
use crate::{Error, Result, SObj, SVal};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// JSON encoding of [`SVal`] trees.
///
/// Binary values have no JSON form and travel as base64 strings; a
/// decoded document therefore reads them back as strings, which is the
/// contract the transports already follow.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &SVal) -> Result<String> {
        let json = to_json(value);
        serde_json::to_string(&json)
            .map_err(|e| Error::Protocol(format!("can't encode into json: {e}")))
    }

    fn decode(&self, input: &str) -> Result<SVal> {
        let json: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| Error::Protocol(format!("can't decode json: {e}")))?;
        Ok(from_json(json))
    }
}

fn to_json(value: &SVal) -> serde_json::Value {
    match value {
        SVal::Null => serde_json::Value::Null,
        SVal::Bool(v) => serde_json::Value::Bool(*v),
        SVal::Int(v) => serde_json::Value::from(*v),
        SVal::Float(v) => serde_json::Value::from(*v),
        SVal::Str(v) => serde_json::Value::String(v.clone()),
        SVal::Binary(v) => serde_json::Value::String(BASE64.encode(v)),
        SVal::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        SVal::Object(obj) => serde_json::Value::Object(
            obj.iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect(),
        ),
    }
}

fn from_json(json: serde_json::Value) -> SVal {
    match json {
        serde_json::Value::Null => SVal::Null,
        serde_json::Value::Bool(v) => SVal::Bool(v),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                SVal::Int(v)
            } else {
                SVal::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(v) => SVal::Str(v),
        serde_json::Value::Array(items) => {
            SVal::Array(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(members) => {
            let mut obj = SObj::new();
            for (k, v) in members {
                obj.emplace(k, from_json(v));
            }
            SVal::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_scalar_roundtrip() {
        let codec = JsonSerializer;
        let mut obj = SObj::new();
        obj.emplace("status", true);
        obj.emplace("count", 42i64);
        obj.emplace("rate", 0.5f64);
        obj.emplace("name", "forja");
        obj.emplace("nothing", SVal::Null);

        let encoded = codec.encode(&SVal::Object(obj.clone())).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, SVal::Object(obj));
    }

    #[test]
    fn test_error_envelope_shape() {
        let codec = JsonSerializer;
        let mut envelope = SObj::new();
        envelope.emplace("status", false);
        envelope.emplace("message", "boom");
        let encoded = codec.encode(&SVal::Object(envelope)).unwrap();
        assert_eq!(encoded, r#"{"status":false,"message":"boom"}"#);
    }

    #[test]
    fn test_nested_and_array() {
        let codec = JsonSerializer;
        let decoded = codec
            .decode(r#"{"a":[1,2.5,"x",null],"b":{"c":true}}"#)
            .unwrap();
        let obj = decoded.as_object().unwrap();
        let a = obj.get("a").as_array().unwrap();
        assert_eq!(a[0], SVal::Int(1));
        assert_eq!(a[1], SVal::Float(2.5));
        assert_eq!(a[2], SVal::Str("x".into()));
        assert_eq!(a[3], SVal::Null);
        assert_eq!(obj.get("b").as_object().unwrap().get_bool("c"), Some(true));
    }

    #[test]
    fn test_binary_as_base64() {
        let codec = JsonSerializer;
        let encoded = codec
            .encode(&SVal::Binary(Bytes::from_static(b"\x00\x01\x02")))
            .unwrap();
        assert_eq!(encoded, r#""AAEC""#);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JsonSerializer.decode("{not json").is_err());
    }
}
