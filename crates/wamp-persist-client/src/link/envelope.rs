use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strum_macros::Display;
use uuid::Uuid;

use super::codec::CodecError;

pub const PROTOCOL_VERSION: u16 = 1;

/// Link message envelope
///
/// Every frame carries one envelope. Replies reuse the `uuid` of the
/// request they answer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub proto: u16,
    pub uuid: String,
    pub kind: MessageKind,
    pub msg: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageKind, msg: serde_json::Value) -> Self {
        Self::new_with_uuid(kind, msg, Uuid::new_v4().to_string())
    }

    pub fn new_with_uuid(kind: MessageKind, msg: serde_json::Value, uuid: String) -> Self {
        Self {
            proto: PROTOCOL_VERSION,
            uuid,
            kind,
            msg,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message<M: Serialize>(kind: MessageKind, message: &M) -> Result<Self, CodecError> {
        let msg = serde_json::to_value(message)
            .map_err(|e| CodecError::SerializationError(e.to_string()))?;
        Ok(Self::new(kind, msg))
    }

    /// Reply to this envelope, keeping its `uuid`.
    pub fn reply<M: Serialize>(&self, kind: MessageKind, message: &M) -> Result<Self, CodecError> {
        let msg = serde_json::to_value(message)
            .map_err(|e| CodecError::SerializationError(e.to_string()))?;
        Ok(Self::new_with_uuid(kind, msg, self.uuid.clone()))
    }

    pub fn message<M: DeserializeOwned>(&self) -> Result<M, CodecError> {
        M::deserialize(&self.msg).map_err(|e| {
            CodecError::DeserializationError(format!("{} payload: {e}", self.kind))
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    Hello,
    Welcome,
    Call,
    Result,
    Error,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    /// Router-initiated, carries no request uuid
    Event,
    Goodbye,
}
