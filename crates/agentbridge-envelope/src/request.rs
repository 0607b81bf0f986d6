use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::envelope::{self, Envelope, Map};
use crate::error::{EnvelopeError, Result};

/// Layout of the `data` section of an outbound action request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestSchema {
    /// `{"seqno": N, "agent_id": A, "action": "<name>"}`.
    #[default]
    Rich,
    /// `{"action": "<name>"}` only, for environments predating agent addressing.
    Legacy,
}

/// One action addressed to one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub seqno: u64,
    pub agent_id: u32,
    pub action: Action,
}

#[derive(Serialize)]
struct LegacyData {
    action: Action,
}

impl ActionRequest {
    pub fn new(seqno: u64, agent_id: u32, action: Action) -> Self {
        Self {
            seqno,
            agent_id,
            action,
        }
    }

    /// Encode as an envelope with an empty header.
    pub fn encode(&self, schema: RequestSchema) -> Result<Vec<u8>> {
        let header = Map::new();
        match schema {
            RequestSchema::Rich => envelope::encode(&header, self),
            RequestSchema::Legacy => envelope::encode(
                &header,
                &LegacyData {
                    action: self.action,
                },
            ),
        }
    }
}

/// An action request as seen by the environment side.
///
/// Accepts both request schemas: `seqno` and `agent_id` are absent in
/// legacy requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct IncomingAction {
    #[serde(default)]
    pub seqno: Option<u64>,
    #[serde(default)]
    pub agent_id: Option<u32>,
    pub action: Action,
}

impl IncomingAction {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let data = serde_json::Value::Object(envelope.data.clone());
        serde_json::from_value(data)
            .map_err(|err| EnvelopeError::MalformedEnvelope(format!("action request: {err}")))
    }

    /// Decode envelope bytes straight into an action request.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_envelope(&envelope::decode(bytes)?)
    }

    pub fn schema(&self) -> RequestSchema {
        if self.seqno.is_some() || self.agent_id.is_some() {
            RequestSchema::Rich
        } else {
            RequestSchema::Legacy
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rich_request_wire_shape() {
        let bytes = ActionRequest::new(1, 7, Action::Up)
            .encode(RequestSchema::Rich)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"header": {}, "data": {"seqno": 1, "agent_id": 7, "action": "up"}})
        );
    }

    #[test]
    fn legacy_request_wire_shape() {
        let bytes = ActionRequest::new(9, 2, Action::RotateClockwise)
            .encode(RequestSchema::Legacy)
            .unwrap();
        assert_eq!(
            bytes,
            br#"{"header":{},"data":{"action":"rotate_clockwise"}}"#
        );
    }

    #[test]
    fn incoming_action_reads_both_schemas() {
        let rich = IncomingAction::decode(
            br#"{"header":{},"data":{"seqno":3,"agent_id":1,"action":"left"}}"#,
        )
        .unwrap();
        assert_eq!(rich.seqno, Some(3));
        assert_eq!(rich.agent_id, Some(1));
        assert_eq!(rich.action, Action::Left);
        assert_eq!(rich.schema(), RequestSchema::Rich);

        let legacy = IncomingAction::decode(br#"{"header":{},"data":{"action":"down"}}"#).unwrap();
        assert_eq!(legacy.seqno, None);
        assert_eq!(legacy.action, Action::Down);
        assert_eq!(legacy.schema(), RequestSchema::Legacy);
    }

    #[test]
    fn incoming_action_rejects_unknown_or_missing_action() {
        for raw in [
            r#"{"header":{},"data":{"action":"jump"}}"#,
            r#"{"header":{},"data":{"seqno":1}}"#,
            r#"{"header":{},"data":{"action":"up","agent_id":-4}}"#,
        ] {
            assert!(
                matches!(
                    IncomingAction::decode(raw.as_bytes()),
                    Err(EnvelopeError::MalformedEnvelope(_))
                ),
                "{raw}"
            );
        }
    }
}
