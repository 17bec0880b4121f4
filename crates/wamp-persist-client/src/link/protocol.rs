//! Payloads carried in [`super::Envelope::msg`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handshake request, answered by [`WelcomeMessage`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub realm: String,

    pub client_info: Option<String>,

    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WelcomeMessage {
    pub session_id: u64,

    /// Router name or version string
    pub router: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub procedure: String,

    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub value: Value,
}

/// Failure reply to any request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Error URI, e.g. `wamp.error.no_such_procedure`
    pub uri: String,

    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    pub topic: String,

    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubscribedMessage {
    pub subscription: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeMessage {
    pub subscription: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub subscription: u64,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GoodbyeMessage {
    pub reason: String,
}
