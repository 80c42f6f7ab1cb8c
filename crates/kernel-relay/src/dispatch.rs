//! Routing of incoming kernel messages.
//!
//! The router owns the callback registry and decides, per message, which
//! consumer sees it:
//!
//! - shell/control replies go to the waiting request's reply channel
//! - iopub messages go to a registered per-type handler (used for comms),
//!   otherwise to the parent request's iopub stream; `status` is also
//!   published as a [`KernelEvent`] and an `idle` status finishes the
//!   parent's iopub phase
//! - stdin `input_request`s go to the parent's input channel
//!
//! Anything without a consumer is published as `KernelEvent::Unsolicited`.
//! Routing never fails.

use std::collections::HashMap;
use std::time::Duration;

use jupyter_wire::{Channel, KernelMessage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::callbacks::{CallbackRegistry, Callbacks, Category};
use crate::connection::ConnectionState;

/// iopub message types that belong to a request's output stream.
const OUTPUT_MSG_TYPES: &[&str] = &[
    "stream",
    "display_data",
    "execute_result",
    "error",
    "clear_output",
    "update_display_data",
    "execute_input",
];

/// Kernel execution state as reported on iopub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    Starting,
    Idle,
    Busy,
    Restarting,
    Autorestarting,
    Dead,
    #[serde(other)]
    Unknown,
}

impl KernelStatus {
    fn from_content(content: &serde_json::Value) -> Self {
        content
            .get("execution_state")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(KernelStatus::Unknown)
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Restarting => "restarting",
            KernelStatus::Autorestarting => "autorestarting",
            KernelStatus::Dead => "dead",
            KernelStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Events published to every subscriber of a kernel connection.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    /// The connection moved to a new state.
    State(ConnectionState),
    /// A connection attempt failed or an open connection dropped.
    ConnectionFailed { attempt: u32, error: String },
    /// A retry is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries are exhausted. Fires once per transition to `Dead`.
    ConnectionDead,
    /// Kernel execution state changed.
    Status {
        status: KernelStatus,
        parent_msg_id: Option<String>,
    },
    /// A message nobody was waiting for.
    Unsolicited(KernelMessage),
}

/// What the router did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Reply,
    Handler,
    Output,
    Status(KernelStatus),
    InputRequest,
    Unsolicited,
    Dropped,
}

/// Message router for one kernel connection.
pub struct Router {
    registry: CallbackRegistry,
    iopub_handlers: HashMap<String, mpsc::UnboundedSender<KernelMessage>>,
    events: broadcast::Sender<KernelEvent>,
}

impl Router {
    pub fn new(events: broadcast::Sender<KernelEvent>) -> Self {
        Self {
            registry: CallbackRegistry::new(),
            iopub_handlers: HashMap::new(),
            events,
        }
    }

    pub fn register(&mut self, msg_id: &str, callbacks: Callbacks) {
        self.registry.register(msg_id, callbacks);
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Send every iopub message of `msg_type` to `handler` instead of the
    /// default routing. Replaces any earlier handler for that type.
    pub fn register_iopub_handler(
        &mut self,
        msg_type: &str,
        handler: mpsc::UnboundedSender<KernelMessage>,
    ) {
        self.iopub_handlers.insert(msg_type.to_string(), handler);
    }

    /// Drop one request's callbacks without invoking them.
    pub fn clear(&mut self, msg_id: &str) -> bool {
        self.registry.clear(msg_id)
    }

    /// Drop all pending callbacks without invoking them.
    pub fn abandon_pending(&mut self) -> usize {
        self.registry.abandon_all()
    }

    pub fn route(&mut self, msg: KernelMessage) -> Routed {
        match &msg.channel {
            Some(Channel::Shell) | Some(Channel::Control) => self.route_reply(msg),
            Some(Channel::IOPub) => self.route_iopub(msg),
            Some(Channel::Stdin) => self.route_input(msg),
            _ => {
                // Older servers omit the channel; infer it from the type.
                if msg.msg_type().ends_with("_reply") {
                    self.route_reply(msg)
                } else if msg.msg_type() == "input_request" {
                    self.route_input(msg)
                } else {
                    self.route_iopub(msg)
                }
            }
        }
    }

    fn route_reply(&mut self, msg: KernelMessage) -> Routed {
        let Some(parent_id) = msg.parent_msg_id().map(str::to_string) else {
            return self.unsolicited(msg);
        };
        let Some(reply_tx) = self.registry.take_reply(&parent_id) else {
            return self.unsolicited(msg);
        };

        if reply_tx.send(msg).is_err() {
            debug!(
                "[router] Reply receiver for {} dropped before the reply arrived",
                parent_id
            );
        }
        self.registry.resolve_partial(&parent_id, Category::Shell);
        Routed::Reply
    }

    fn route_iopub(&mut self, msg: KernelMessage) -> Routed {
        let msg_type = msg.msg_type().to_string();

        if let Some(handler) = self.iopub_handlers.get(&msg_type) {
            match handler.send(msg) {
                Ok(()) => return Routed::Handler,
                Err(mpsc::error::SendError(msg)) => {
                    debug!("[router] Handler for {} went away, removing it", msg_type);
                    self.iopub_handlers.remove(&msg_type);
                    return self.route_iopub(msg);
                }
            }
        }

        let parent_id = msg.parent_msg_id().map(str::to_string);

        if msg_type == "status" {
            let status = KernelStatus::from_content(&msg.content);
            let _ = self.events.send(KernelEvent::Status {
                status,
                parent_msg_id: parent_id.clone(),
            });

            if let Some(id) = parent_id {
                if let Some(iopub) = self.registry.iopub(&id) {
                    let _ = iopub.send(msg);
                }
                if status == KernelStatus::Idle {
                    self.registry.resolve_partial(&id, Category::IOPub);
                }
            }
            return Routed::Status(status);
        }

        if OUTPUT_MSG_TYPES.contains(&msg_type.as_str()) {
            if let Some(iopub) = parent_id.as_deref().and_then(|id| self.registry.iopub(id)) {
                if iopub.send(msg).is_err() {
                    debug!("[router] Output receiver dropped for {:?}", parent_id);
                }
                return Routed::Output;
            }
        }

        self.unsolicited(msg)
    }

    fn route_input(&mut self, msg: KernelMessage) -> Routed {
        let input = msg
            .parent_msg_id()
            .and_then(|id| self.registry.input(id));

        match input {
            Some(tx) => {
                let _ = tx.send(msg);
                Routed::InputRequest
            }
            None => {
                warn!(
                    "[router] No input callback for {} (parent {:?})",
                    msg.msg_type(),
                    msg.parent_msg_id()
                );
                Routed::Dropped
            }
        }
    }

    fn unsolicited(&self, msg: KernelMessage) -> Routed {
        debug!(
            "[router] Unsolicited {} (parent {:?})",
            msg.msg_type(),
            msg.parent_msg_id()
        );
        let _ = self.events.send(KernelEvent::Unsolicited(msg));
        Routed::Unsolicited
    }
}
