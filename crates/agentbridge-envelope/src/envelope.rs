use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EnvelopeError, Result};

/// String-keyed JSON mapping used for both envelope sections.
pub type Map = serde_json::Map<String, Value>;

/// The unit exchanged on both channels.
///
/// `header` carries protocol metadata (sequence numbers, topic annotations)
/// and may be empty; `data` carries the payload. The codec never requires any
/// particular key in either section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub header: Map,
    pub data: Map,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    header: &'a Map,
    data: &'a Map,
}

impl Envelope {
    pub fn new(header: Map, data: Map) -> Self {
        Self { header, data }
    }

    /// Envelope with an empty header.
    pub fn with_data(data: Map) -> Self {
        Self::new(Map::new(), data)
    }

    /// Look up a `data` field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Look up a `data` field holding a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Look up a `header` field holding an unsigned integer.
    pub fn header_u64(&self, key: &str) -> Option<u64> {
        self.header.get(key).and_then(Value::as_u64)
    }

    /// Canonical wire form of this envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        // Infallible for string-keyed `Value` maps written to a Vec.
        if serde_json::to_writer(
            &mut out,
            &EnvelopeRef {
                header: &self.header,
                data: &self.data,
            },
        )
        .is_err()
        {
            out.clear();
            out.extend_from_slice(br#"{"header":{},"data":{}}"#);
        }
        out
    }

    pub fn into_parts(self) -> (Map, Map) {
        (self.header, self.data)
    }
}

/// Encode a header and data section into canonical envelope JSON.
///
/// Output is `{"header":{...},"data":{...}}` with nested keys in sorted
/// order. Both sides must serialize to JSON objects with string keys;
/// anything else fails with [`EnvelopeError::UnsupportedValue`], as does a
/// NaN or infinite float anywhere in either section.
pub fn encode<H, D>(header: &H, data: &D) -> Result<Vec<u8>>
where
    H: Serialize + ?Sized,
    D: Serialize + ?Sized,
{
    let header = to_mapping("header", header)?;
    let data = to_mapping("data", data)?;
    Ok(Envelope::new(header, data).to_bytes())
}

/// Decode envelope JSON.
///
/// Fails with [`EnvelopeError::MalformedEnvelope`] when the input is not JSON
/// or its top level is not an object with exactly the `header` and `data`
/// mappings.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(|err| EnvelopeError::MalformedEnvelope(err.to_string()))
}

pub(crate) fn to_mapping<T: Serialize + ?Sized>(section: &str, value: &T) -> Result<Map> {
    crate::finite::check(value)
        .map_err(|err| EnvelopeError::UnsupportedValue(format!("{section}: {err}")))?;
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(EnvelopeError::UnsupportedValue(format!(
            "{section} must be a mapping, got {}",
            value_kind(&other)
        ))),
        Err(err) => Err(EnvelopeError::UnsupportedValue(format!("{section}: {err}"))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn encode_empty_header_and_action() {
        let bytes = encode(&Map::new(), &map(json!({"action": "up"}))).unwrap();
        assert_eq!(bytes, br#"{"header":{},"data":{"action":"up"}}"#);
    }

    #[test]
    fn encode_is_canonical_regardless_of_insertion_order() {
        let mut a = Map::new();
        a.insert("y".into(), json!(2));
        a.insert("x".into(), json!(1));
        let mut b = Map::new();
        b.insert("x".into(), json!(1));
        b.insert("y".into(), json!(2));

        assert_eq!(encode(&Map::new(), &a).unwrap(), encode(&Map::new(), &b).unwrap());
    }

    #[test]
    fn round_trip_preserves_nested_values() {
        let header = map(json!({"seqno": 42, "topic": "/agents/1/state", "version": "1.0"}));
        let data = map(json!({
            "position": {"x": -1.5, "y": 3},
            "sensors": [true, false, null],
            "label": "agent \"one\"",
            "empty": {}
        }));

        let decoded = decode(&encode(&header, &data).unwrap()).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn encode_accepts_typed_structs_and_maps() {
        #[derive(Serialize)]
        struct Pose {
            x: i32,
            heading: &'static str,
        }

        let mut header = BTreeMap::new();
        header.insert("seqno", 3u64);
        let bytes = encode(&header, &Pose { x: 4, heading: "north" }).unwrap();

        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.header_u64("seqno"), Some(3));
        assert_eq!(envelope.get_str("heading"), Some("north"));
        assert_eq!(envelope.get("x"), Some(&json!(4)));
    }

    #[test]
    fn encode_rejects_non_mapping_sections() {
        let err = encode(&Map::new(), &vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedValue(ref msg) if msg.contains("sequence")));

        let err = encode(&"header", &Map::new()).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedValue(ref msg) if msg.starts_with("header")));
    }

    #[test]
    fn encode_rejects_non_string_keys() {
        let mut data = HashMap::new();
        data.insert((1u8, 2u8), "tuple key");

        let err = encode(&Map::new(), &data).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedValue(_)));
    }

    #[test]
    fn encode_rejects_non_finite_numbers() {
        #[derive(Serialize)]
        struct Pose {
            x: f64,
            y: f64,
        }

        let err = encode(&Map::new(), &Pose { x: 1.0, y: f64::NAN }).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedValue(ref msg) if msg.starts_with("data")));

        let mut header = BTreeMap::new();
        header.insert("stamp", f64::INFINITY);
        assert!(matches!(
            encode(&header, &Map::new()),
            Err(EnvelopeError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn decode_rejects_non_json() {
        let err = decode(b"not json at all").unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_rejects_wrong_shapes() {
        let cases: &[&str] = &[
            r#"{"header":{}}"#,
            r#"{"data":{}}"#,
            r#"{"header":{},"data":[]}"#,
            r#"{"header":null,"data":{}}"#,
            r#"{"header":{},"data":{},"extra":1}"#,
            r#"["header","data"]"#,
            r#"{"status":"SUCCESS","reason":""}"#,
        ];
        for case in cases {
            let result = decode(case.as_bytes());
            assert!(
                matches!(result, Err(EnvelopeError::MalformedEnvelope(_))),
                "{case} should be malformed"
            );
        }
    }

    #[test]
    fn decode_accepts_keys_in_any_order() {
        let envelope = decode(br#"{"data":{"status":"SUCCESS"},"header":{"seqno":1}}"#).unwrap();
        assert_eq!(envelope.get_str("status"), Some("SUCCESS"));
        assert_eq!(envelope.header_u64("seqno"), Some(1));
    }

    #[test]
    fn to_bytes_matches_encode() {
        let envelope = Envelope::with_data(map(json!({"status": "ok"})));
        assert_eq!(
            envelope.to_bytes(),
            encode(&envelope.header, &envelope.data).unwrap()
        );
    }
}
