//! Control-plane message types
//!
//! Frames are JSON objects, one per socket message. The shape of an inbound
//! object decides what it is: a server hello carries `server_version`, an
//! error signal carries `error_code`, a reply carries `message_id`, a push
//! carries `event`.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation id reserved for the authentication handshake
pub const AUTH_MESSAGE_ID: &str = "auth-handshake";

/// First schema version that requires a credential
pub const MIN_AUTH_SCHEMA_VERSION: u32 = 28;

/// Error code the server uses for "authentication required"
pub const ERROR_CODE_AUTH_REQUIRED: i64 = 20;

/// Outbound request
///
/// # Examples
/// ```
/// use ma_session::protocol::CommandMessage;
/// use serde_json::json;
///
/// let msg = CommandMessage::new("3f2a", "players/all", json!({}));
/// let text = serde_json::to_string(&msg).unwrap();
/// assert!(text.contains("\"command\":\"players/all\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMessage {
    pub message_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl CommandMessage {
    /// Build a request; non-object `args` are wrapped as `{"value": args}`
    /// and `null` becomes an empty mapping.
    pub fn new(message_id: impl Into<String>, command: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            message_id: message_id.into(),
            command: command.into(),
            args,
        }
    }

    /// The single handshake frame sent when the schema requires a credential
    pub fn auth(token: &str) -> Self {
        let mut args = Map::new();
        args.insert("token".to_string(), Value::String(token.to_string()));
        Self {
            message_id: AUTH_MESSAGE_ID.to_string(),
            command: "auth".to_string(),
            args,
        }
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server hello, immutable for the lifetime of one connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_version: String,
    pub schema_version: u32,
    #[serde(default)]
    pub min_supported_schema_version: u32,
    #[serde(default)]
    pub server_id: String,
}

impl ServerInfo {
    /// Legacy servers accept commands without a credential exchange
    pub fn requires_auth(&self) -> bool {
        self.schema_version >= MIN_AUTH_SCHEMA_VERSION
    }

    /// Decode a hello frame; `None` when the frame is not a hello at all
    pub fn from_frame(text: &str) -> Option<Result<Self, SessionError>> {
        match InboundMessage::parse(text) {
            Ok(InboundMessage::Hello(info)) => Some(Ok(info)),
            Ok(_) => None,
            Err(e) => {
                let is_hello = serde_json::from_str::<Value>(text)
                    .map(|v| v.get("server_version").is_some())
                    .unwrap_or(false);
                is_hello.then_some(Err(e))
            }
        }
    }
}

/// Result payload of the handshake reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthResult {
    pub authenticated: bool,
}

/// Inbound frame after shape classification
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Hello(ServerInfo),
    Result {
        message_id: String,
        result: Value,
    },
    Error {
        message_id: Option<String>,
        code: i64,
        details: String,
    },
    Event {
        event: String,
        object_id: Option<String>,
        data: Value,
    },
}

impl InboundMessage {
    /// Classify a text frame by its discriminating field
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut obj) = value else {
            return Err(SessionError::protocol("frame is not a JSON object"));
        };

        if obj.contains_key("server_version") {
            let info: ServerInfo = serde_json::from_value(Value::Object(obj))
                .map_err(|e| SessionError::protocol(format!("malformed server hello: {e}")))?;
            return Ok(InboundMessage::Hello(info));
        }

        let message_id = obj.remove("message_id").and_then(id_to_string);

        if let Some(code) = obj.get("error_code") {
            let code = code
                .as_i64()
                .ok_or_else(|| SessionError::protocol("error_code is not an integer"))?;
            let details = obj
                .get("details")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(InboundMessage::Error {
                message_id,
                code,
                details,
            });
        }

        if let Some(message_id) = message_id {
            let result = obj.remove("result").unwrap_or(Value::Null);
            return Ok(InboundMessage::Result { message_id, result });
        }

        if let Some(event) = obj.get("event").and_then(Value::as_str) {
            let event = event.to_string();
            let object_id = obj.remove("object_id").and_then(id_to_string);
            let data = obj.remove("data").unwrap_or(Value::Null);
            return Ok(InboundMessage::Event {
                event,
                object_id,
                data,
            });
        }

        Err(SessionError::protocol("unrecognised frame shape"))
    }
}

/// Servers send ids as strings; tolerate numeric ids from older builds
fn id_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Evaluate the handshake reply; anything but `authenticated: true` is a rejection
pub fn parse_auth_result(result: &Value) -> bool {
    serde_json::from_value::<AuthResult>(result.clone())
        .map(|r| r.authenticated)
        .unwrap_or(false)
}

/// Push event delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PlayerUpdated {
        object_id: Option<String>,
        data: Value,
    },
    PlayersUpdated {
        data: Value,
    },
    QueueUpdated {
        object_id: Option<String>,
        data: Value,
    },
    Error {
        code: i64,
        details: String,
    },
    /// Any push whose name has no dedicated variant
    Other {
        event: String,
        object_id: Option<String>,
        data: Value,
    },
}

impl ServerEvent {
    pub fn from_push(event: String, object_id: Option<String>, data: Value) -> Self {
        match event.as_str() {
            "player_updated" => ServerEvent::PlayerUpdated { object_id, data },
            "players_updated" => ServerEvent::PlayersUpdated { data },
            "queue_updated" => ServerEvent::QueueUpdated { object_id, data },
            _ => ServerEvent::Other {
                event,
                object_id,
                data,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServerEvent::PlayerUpdated { .. } => "player_updated",
            ServerEvent::PlayersUpdated { .. } => "players_updated",
            ServerEvent::QueueUpdated { .. } => "queue_updated",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Other { event, .. } => event,
        }
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, ServerEvent::Error { code, .. } if *code == ERROR_CODE_AUTH_REQUIRED)
    }
}
