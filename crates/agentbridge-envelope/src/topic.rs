//! Topic-tagged telemetry messages.
//!
//! On the wire a telemetry message is `<topic> <envelope-json>`. There is no
//! length prefix between the two: the payload starts at the first `{`, so
//! topics must never contain `{`.

use serde::Serialize;

use crate::envelope::{self, Envelope, Map};
use crate::error::{EnvelopeError, Result};

/// Character that opens the JSON payload of a telemetry message.
pub const PAYLOAD_DELIMITER: char = '{';

/// Separator written between topic and payload.
pub const TOPIC_SEPARATOR: char = ' ';

/// Split a raw telemetry message into `(topic, payload)`.
///
/// The payload starts at the first `{`. The topic is everything before it,
/// minus the one separator character immediately preceding the `{`.
pub fn split_message(raw: &str) -> Result<(&str, &str)> {
    let ndx = raw.find(PAYLOAD_DELIMITER).ok_or_else(|| {
        EnvelopeError::MalformedMessage("no '{' payload delimiter in message".to_string())
    })?;

    let mut topic = raw[..ndx].chars();
    topic.next_back();
    Ok((topic.as_str(), &raw[ndx..]))
}

/// Build the raw wire form `<topic> <payload>`.
pub fn compose_message(topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if topic.contains(PAYLOAD_DELIMITER) {
        return Err(EnvelopeError::UnsupportedValue(format!(
            "topic '{topic}' contains the payload delimiter '{{'"
        )));
    }
    let mut out = Vec::with_capacity(topic.len() + 1 + payload.len());
    out.extend_from_slice(topic.as_bytes());
    out.push(TOPIC_SEPARATOR as u8);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Prefix filter over topic strings. The empty prefix matches every topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFilter {
    prefix: String,
}

impl TopicFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Filter that matches every topic.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic.starts_with(&self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_all(&self) -> bool {
        self.prefix.is_empty()
    }
}

/// A demultiplexed telemetry message.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub topic: String,
    pub header: Map,
    pub data: Map,
}

impl TelemetryMessage {
    pub fn new(topic: impl Into<String>, envelope: Envelope) -> Self {
        let (header, data) = envelope.into_parts();
        Self {
            topic: topic.into(),
            header,
            data,
        }
    }

    /// Split and decode a raw message, without any topic filtering.
    pub fn parse(raw: &str) -> Result<Self> {
        let (topic, payload) = split_message(raw)?;
        Ok(Self::new(topic, decode_payload(payload)?))
    }

    /// Build the raw wire form of a message from a topic and serializable sections.
    pub fn encode<H, D>(topic: &str, header: &H, data: &D) -> Result<Vec<u8>>
    where
        H: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        compose_message(topic, &envelope::encode(header, data)?)
    }

    /// Header sequence number stamped by the publisher, if any.
    pub fn seqno(&self) -> Option<u64> {
        self.header.get("seqno").and_then(serde_json::Value::as_u64)
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.header, self.data)
    }
}

/// Decode the payload half of a telemetry message.
///
/// Envelope decode failures are reported as [`EnvelopeError::MalformedMessage`].
pub fn decode_payload(payload: &str) -> Result<Envelope> {
    envelope::decode(payload.as_bytes()).map_err(|err| match err {
        EnvelopeError::MalformedEnvelope(reason) => EnvelopeError::MalformedMessage(reason),
        other => other,
    })
}
