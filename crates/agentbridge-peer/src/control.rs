use serde::{Deserialize, Serialize};

use crate::error::Result;

/// CONTROL message type: start receiving topics with this prefix.
pub const CONTROL_SUBSCRIBE: &str = "subscribe";
/// CONTROL message type: stop receiving topics with this prefix.
pub const CONTROL_UNSUBSCRIBE: &str = "unsubscribe";

/// CONTROL channel message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub topic: String,
}

impl ControlMessage {
    /// Create a subscribe message. The empty prefix subscribes to everything.
    pub fn subscribe(prefix: &str) -> Self {
        Self {
            msg_type: CONTROL_SUBSCRIBE.to_string(),
            topic: prefix.to_string(),
        }
    }

    /// Create an unsubscribe message.
    pub fn unsubscribe(prefix: &str) -> Self {
        Self {
            msg_type: CONTROL_UNSUBSCRIBE.to_string(),
            topic: prefix.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_subscribe(&self) -> bool {
        self.msg_type == CONTROL_SUBSCRIBE
    }

    pub fn is_unsubscribe(&self) -> bool {
        self.msg_type == CONTROL_UNSUBSCRIBE
    }
}
