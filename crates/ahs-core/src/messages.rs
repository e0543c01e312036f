//! Wire types shared by the server, the CLI and the channel layer.
//!
//! All frames are JSON text. A demultiplexed socket wraps every frame as
//! [`StreamFrame`]; inside a stream the command application speaks
//! [`ClientFrame`]s in and [`ResponseEnvelope`]s out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::Identity;

/// `type` of a client frame asking for a command to run.
pub const COMMAND_REQUEST: &str = "command.request";
/// `type` of a channel message carrying one response envelope.
pub const COMMAND_RESPONSE: &str = "command.response";

/// A demultiplexed frame: `{"stream": name, "payload": json}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub stream: String,
    pub payload: Value,
}

/// A dispatcher-facing frame: `{"type": t, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
}

/// The `data` of a `command.request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInvocation {
    /// Namespace; falls back to the route's app when absent.
    #[serde(default)]
    pub app: Option<String>,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(rename = "uniqueId", default = "default_unique_id")]
    pub unique_id: Value,
}

fn default_unique_id() -> Value {
    Value::from(0)
}

/// One inbound unit of work, as it travels through the channel layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_name: String,
    #[serde(default)]
    pub positional_args: Vec<Value>,
    #[serde(default)]
    pub keyword_args: Map<String, Value>,
    pub owner: Identity,
    pub channel_name: String,
    pub app_namespace: String,
    pub correlation_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
}

impl CommandRequest {
    pub fn new(
        app_namespace: impl Into<String>,
        command_name: impl Into<String>,
        owner: Identity,
        channel_name: impl Into<String>,
    ) -> Self {
        Self {
            command_name: command_name.into(),
            positional_args: Vec::new(),
            keyword_args: Map::new(),
            owner,
            channel_name: channel_name.into(),
            app_namespace: app_namespace.into(),
            correlation_id: default_unique_id(),
            page_name: None,
            socket_url: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.positional_args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.keyword_args = kwargs;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<Value>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

/// One unit of command response: `{app, cmd, data, uniqueId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub app: String,
    pub cmd: String,
    pub data: Value,
    #[serde(rename = "uniqueId")]
    pub unique_id: Value,
}

impl ResponseEnvelope {
    pub fn for_request(req: &CommandRequest, data: Value) -> Self {
        Self {
            app: req.app_namespace.clone(),
            cmd: req.command_name.clone(),
            data,
            unique_id: req.correlation_id.clone(),
        }
    }
}

/// Messages carried by the channel layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    #[serde(rename = "command.request")]
    CommandRequest(CommandRequest),
    #[serde(rename = "command.response")]
    CommandResponse(ResponseEnvelope),
}

/// Structured error reply written back on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn invalid_json() -> Self {
        Self::new("Invalid JSON format")
    }

    pub fn missing_type() -> Self {
        Self::new("Missing kwarg in websocket message. ('type')")
    }

    pub fn unsupported_type(t: &str) -> Self {
        Self::new(format!("Unsupported message type '{t}'"))
    }
}
