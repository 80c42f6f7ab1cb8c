//! Jupyter kernel message types for notebook front-ends.
//!
//! This crate provides the message model and wire framing used between a
//! notebook front-end and a Jupyter server's kernel channels WebSocket.
//!
//! # Features
//!
//! - `KernelMessage`, a message whose `content` stays raw JSON until the
//!   consumer interprets it by `msg_type`
//! - Tolerant `parent_header` handling (`{}`, `null` or missing all mean "none")
//! - JSON text frames and the binary multi-part framing used for messages
//!   that carry raw buffers
//! - Conversion into `jupyter_protocol::JupyterMessage` for typed content

mod frame;
mod message;

pub use frame::{deserialize_binary, serialize_binary, WireFrame};
pub use message::{KernelMessage, WireError, PROTOCOL_VERSION};

pub use jupyter_protocol::{Channel, Header};
