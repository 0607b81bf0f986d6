//! The message envelope shared by the agentbridge command and telemetry channels.
//!
//! Every message is a JSON object with exactly two mappings, `header` and
//! `data`. Command requests put an action descriptor under `data`; telemetry
//! prefixes the encoded envelope with a topic string.

pub mod action;
pub mod envelope;
pub mod error;
mod finite;
pub mod request;
pub mod topic;

pub use action::Action;
pub use envelope::{decode, encode, Envelope, Map};
pub use error::{EnvelopeError, Result};
pub use request::{ActionRequest, IncomingAction, RequestSchema};
pub use topic::{compose_message, decode_payload, split_message, TelemetryMessage, TopicFilter};
