use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub const HELLO_MESSAGE_TYPE: &str = "hello";
pub const DISCONNECT_MESSAGE_TYPE: &str = "disconnect";

/// Per-run metadata handed to the start hook alongside every relayed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHostedContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bot_access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DebugInfo {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub build: Option<i64>,
}

/// Inbound envelope read from the relay connection.
#[derive(Debug, Default, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub debug_info: DebugInfo,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub envelope_id: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
    #[serde(default)]
    pub accepts_response_payload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    Disconnect,
    Event,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self.msg_type.as_str() {
            HELLO_MESSAGE_TYPE => MessageKind::Hello,
            DISCONNECT_MESSAGE_TYPE => MessageKind::Disconnect,
            _ => MessageKind::Event,
        }
    }
}

/// JSON document written to the start hook's stdin for one event.
#[derive(Debug, Serialize)]
pub struct SocketEvent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a RawValue>,
    pub context: &'a LocalHostedContext,
}

/// Response written back for a successfully handled envelope.
#[derive(Debug, Serialize)]
pub struct LinkResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub envelope_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl LinkResponse {
    /// Builds a response from raw hook output. Blank output carries no
    /// payload; anything else must be a valid JSON document.
    pub fn new(envelope_id: impl Into<String>, output: &str) -> Result<Self, serde_json::Error> {
        let payload = if output.trim().is_empty() {
            None
        } else {
            Some(RawValue::from_string(output.to_owned())?)
        };
        Ok(Self {
            envelope_id: envelope_id.into(),
            payload,
        })
    }
}
