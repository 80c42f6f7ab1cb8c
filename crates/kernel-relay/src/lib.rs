//! kernel-relay - Notebook front-end messaging for Jupyter kernels.
//!
//! Connects to a Jupyter server's kernel over its WebSocket channels
//! endpoint and relays requests, replies and side-effect messages between
//! the kernel and notebook-side consumers (cells, output areas, comms).
//!
//! The transport runs as a background task behind a clonable
//! [`KernelHandle`]. Each request registers callbacks keyed by its message
//! id, and incoming messages are routed to them by `parent_header`.
//! Lost connections are retried with exponential backoff until the retry
//! budget runs out, at which point a single dead-connection event fires.
//!
//! Session and kernel lifecycle goes through the server's REST API
//! ([`rest::ServerClient`]).

use std::path::PathBuf;

pub mod callbacks;
pub mod cell;
pub mod comm;
pub mod connection;
pub mod dispatch;
pub mod kernel;
pub mod output;
pub mod render;
pub mod rest;
pub mod settings;

pub use callbacks::Callbacks;
pub use connection::{ConnectionState, ReconnectPolicy};
pub use dispatch::{KernelEvent, KernelStatus};
pub use jupyter_wire::{Channel, KernelMessage};
pub use kernel::{
    ExecuteOptions, Execution, KernelClient, KernelConnectionConfig, KernelError, KernelEvents,
    KernelHandle,
};

/// Directory holding kernel-relay's configuration.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-relay")
}
