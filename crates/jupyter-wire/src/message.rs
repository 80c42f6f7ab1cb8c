//! Core kernel message type.

use bytes::Bytes;
use chrono::Utc;
use jupyter_protocol::{Channel, Header, JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Error type for message encoding, decoding and conversion.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Failed to parse message content: {0}")]
    Content(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed binary frame: {0}")]
    Frame(String),
}

/// A kernel message as it travels over the channels WebSocket.
///
/// - `content` is raw JSON, interpreted later based on `header.msg_type`
/// - `parent_header` may arrive as `{}`, `null` or a full header, and is
///   written back out as `{}` when absent
/// - `buffers` never appear in the JSON body; they travel as raw segments
///   of a binary frame (see [`crate::WireFrame`])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,

    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header",
        serialize_with = "serialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(skip)]
    pub buffers: Vec<Bytes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

impl KernelMessage {
    /// Build a new request with a fresh `msg_id` and the current timestamp.
    pub fn new(
        session: &str,
        username: &str,
        channel: Channel,
        msg_type: &str,
        content: Value,
    ) -> Self {
        KernelMessage {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                username: username.to_string(),
                session: session.to_string(),
                date: Utc::now(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
            channel: Some(channel),
        }
    }

    /// Attach a parent header, linking this message to an earlier request.
    pub fn with_parent(mut self, parent: &Header) -> Self {
        self.parent_header = Some(parent.clone());
        self
    }

    /// Attach raw buffers. Messages with buffers go out as binary frames.
    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Serialize to the JSON text form (buffers are not included).
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON text form. The result carries no buffers.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl TryFrom<KernelMessage> for JupyterMessage {
    type Error = WireError;

    fn try_from(msg: KernelMessage) -> Result<Self, Self::Error> {
        let content = JupyterMessageContent::from_type_and_content(&msg.header.msg_type, msg.content)
            .map_err(|e| WireError::Content(e.to_string()))?;

        Ok(JupyterMessage {
            zmq_identities: Vec::new(),
            header: msg.header,
            parent_header: msg.parent_header,
            metadata: msg.metadata,
            content,
            buffers: msg.buffers,
            channel: msg.channel,
        })
    }
}
