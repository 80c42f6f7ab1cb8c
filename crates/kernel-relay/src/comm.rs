//! Comm channels between the client and kernel-side objects.
//!
//! The comm protocol has three message types:
//! - `comm_open`: creates a channel for a target, with initial data
//! - `comm_msg`: data on an open channel
//! - `comm_close`: closes the channel
//!
//! Either side may open a comm. Kernel-opened comms are delivered to the
//! receiver registered for their target name; opens for unknown targets are
//! answered with `comm_close`.
//!
//! The manager also keeps a state snapshot per comm. For widgets the
//! `comm_open` carries the model in `data.state`, and `comm_msg` with
//! `method: "update"` carries state deltas.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use jupyter_wire::{Channel, KernelMessage};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::callbacks::Callbacks;
use crate::kernel::{KernelError, KernelHandle};

const COMM_MSG_TYPES: [&str; 3] = ["comm_open", "comm_msg", "comm_close"];

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("Comm {0} is closed")]
    Closed(String),
}

/// Something that happened on an open comm.
#[derive(Debug, Clone)]
pub enum CommEvent {
    Message { data: Value, buffers: Vec<Bytes> },
    Closed { data: Value },
}

/// Current state of a comm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommSnapshot {
    pub comm_id: String,
    pub target_name: String,
    /// Initial `data.state`, with every update merged in.
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

impl CommSnapshot {
    fn new(comm_id: &str, target_name: &str, data: &Value) -> Self {
        let state = data.get("state").cloned().unwrap_or_else(|| json!({}));
        let model_field = |key: &str| state.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            comm_id: comm_id.to_string(),
            target_name: target_name.to_string(),
            model_module: model_field("_model_module"),
            model_name: model_field("_model_name"),
            state,
        }
    }

    /// Merge `data.state` into the snapshot if `data` is an update.
    fn apply(&mut self, data: &Value) {
        if data.get("method").and_then(Value::as_str) != Some("update") {
            return;
        }
        if let (Some(existing), Some(delta)) = (
            self.state.as_object_mut(),
            data.get("state").and_then(Value::as_object),
        ) {
            for (key, value) in delta {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
}

struct CommEntry {
    snapshot: CommSnapshot,
    events: mpsc::UnboundedSender<CommEvent>,
    seq: u64,
}

/// Open comms and registered targets.
#[derive(Default)]
struct CommTable {
    targets: HashMap<String, mpsc::UnboundedSender<Comm>>,
    comms: HashMap<String, CommEntry>,
    next_seq: u64,
}

impl CommTable {
    fn insert(
        &mut self,
        comm_id: &str,
        target_name: &str,
        data: &Value,
    ) -> mpsc::UnboundedReceiver<CommEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.comms.insert(
            comm_id.to_string(),
            CommEntry {
                snapshot: CommSnapshot::new(comm_id, target_name, data),
                events,
                seq,
            },
        );
        rx
    }

    fn on_msg(&mut self, comm_id: &str, data: Value, buffers: Vec<Bytes>) -> bool {
        let Some(entry) = self.comms.get_mut(comm_id) else {
            return false;
        };
        entry.snapshot.apply(&data);
        let _ = entry.events.send(CommEvent::Message { data, buffers });
        true
    }

    fn on_close(&mut self, comm_id: &str, data: Value) -> bool {
        match self.comms.remove(comm_id) {
            Some(entry) => {
                let _ = entry.events.send(CommEvent::Closed { data });
                true
            }
            None => false,
        }
    }

    fn snapshots(&self) -> Vec<CommSnapshot> {
        let mut entries: Vec<_> = self.comms.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.snapshot.clone()).collect()
    }
}

/// One end of a comm channel.
pub struct Comm {
    comm_id: String,
    target_name: String,
    events: mpsc::UnboundedReceiver<CommEvent>,
    handle: KernelHandle,
    table: Arc<Mutex<CommTable>>,
    closed: bool,
}

impl Comm {
    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Next event from the kernel, `None` once the comm is gone.
    pub async fn recv(&mut self) -> Option<CommEvent> {
        let event = self.events.recv().await;
        if matches!(event, Some(CommEvent::Closed { .. })) {
            self.closed = true;
        }
        event
    }

    /// Send `comm_msg`. Fails once either side has closed the comm.
    /// Returns the message id.
    pub async fn send(&self, data: Value) -> Result<String, CommError> {
        if self.closed {
            return Err(CommError::Closed(self.comm_id.clone()));
        }
        match self.table.lock().await.comms.get_mut(&self.comm_id) {
            Some(entry) => entry.snapshot.apply(&data),
            None => return Err(CommError::Closed(self.comm_id.clone())),
        }
        let msg_id = self.handle.send(
            Channel::Shell,
            "comm_msg",
            json!({ "comm_id": self.comm_id, "data": data }),
            Callbacks::default(),
        )?;
        Ok(msg_id)
    }

    /// Send `comm_close` and forget the comm.
    pub async fn close(&mut self, data: Value) -> Result<(), CommError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.table.lock().await.comms.remove(&self.comm_id);
        self.handle.send(
            Channel::Shell,
            "comm_close",
            json!({ "comm_id": self.comm_id, "data": data }),
            Callbacks::default(),
        )?;
        Ok(())
    }
}

/// Tracks comms for one kernel connection.
#[derive(Clone)]
pub struct CommManager {
    handle: KernelHandle,
    table: Arc<Mutex<CommTable>>,
}

impl CommManager {
    /// Take over the comm message types on `handle` and start routing them.
    pub fn start(handle: KernelHandle) -> Result<Self, KernelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for msg_type in COMM_MSG_TYPES {
            handle.route_iopub_to(msg_type, tx.clone())?;
        }

        let manager = Self {
            handle,
            table: Arc::new(Mutex::new(CommTable::default())),
        };
        tokio::spawn(manager.clone().run(rx));
        Ok(manager)
    }

    /// Receive comms the kernel opens for `target_name`. Registering a
    /// target again replaces the earlier receiver.
    pub async fn register_target(&self, target_name: &str) -> mpsc::UnboundedReceiver<Comm> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.table
            .lock()
            .await
            .targets
            .insert(target_name.to_string(), tx);
        rx
    }

    pub async fn unregister_target(&self, target_name: &str) {
        self.table.lock().await.targets.remove(target_name);
    }

    /// Open a comm from the client side.
    pub async fn open(&self, target_name: &str, data: Value) -> Result<Comm, CommError> {
        let comm_id = Uuid::new_v4().to_string();
        let events = self
            .table
            .lock()
            .await
            .insert(&comm_id, target_name, &data);

        let sent = self.handle.send(
            Channel::Shell,
            "comm_open",
            json!({ "comm_id": comm_id, "target_name": target_name, "data": data }),
            Callbacks::default(),
        );
        if let Err(e) = sent {
            self.table.lock().await.comms.remove(&comm_id);
            return Err(e.into());
        }

        Ok(self.comm(comm_id, target_name, events))
    }

    /// Snapshots of all open comms, oldest first.
    pub async fn snapshots(&self) -> Vec<CommSnapshot> {
        self.table.lock().await.snapshots()
    }

    fn comm(
        &self,
        comm_id: String,
        target_name: &str,
        events: mpsc::UnboundedReceiver<CommEvent>,
    ) -> Comm {
        Comm {
            comm_id,
            target_name: target_name.to_string(),
            events,
            handle: self.handle.clone(),
            table: self.table.clone(),
            closed: false,
        }
    }

    async fn run(self, mut messages: mpsc::UnboundedReceiver<KernelMessage>) {
        while let Some(msg) = messages.recv().await {
            self.on_message(msg).await;
        }
        debug!("[comm] Comm routing stopped");
        self.table.lock().await.comms.clear();
    }

    async fn on_message(&self, msg: KernelMessage) {
        let Some(comm_id) = msg.content.get("comm_id").and_then(Value::as_str) else {
            warn!("[comm] {} without comm_id", msg.msg_type());
            return;
        };
        let comm_id = comm_id.to_string();
        let data = msg.content.get("data").cloned().unwrap_or_else(|| json!({}));
        let msg_type = msg.msg_type().to_string();

        match msg_type.as_str() {
            "comm_open" => {
                let target_name = msg
                    .content
                    .get("target_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.on_open(comm_id, target_name, &data).await;
            }
            "comm_msg" => {
                if !self.table.lock().await.on_msg(&comm_id, data, msg.buffers) {
                    debug!("[comm] Message for unknown comm {}", comm_id);
                }
            }
            "comm_close" => {
                if !self.table.lock().await.on_close(&comm_id, data) {
                    debug!("[comm] Close for unknown comm {}", comm_id);
                }
            }
            other => debug!("[comm] Ignoring {}", other),
        }
    }

    async fn on_open(&self, comm_id: String, target_name: &str, data: &Value) {
        let mut table = self.table.lock().await;
        let target = table
            .targets
            .get(target_name)
            .filter(|tx| !tx.is_closed())
            .cloned();

        let Some(target) = target else {
            drop(table);
            warn!(
                "[comm] No target '{}' registered, closing comm {}",
                target_name, comm_id
            );
            let reply = self.handle.send(
                Channel::Shell,
                "comm_close",
                json!({ "comm_id": comm_id, "data": {} }),
                Callbacks::default(),
            );
            if let Err(e) = reply {
                warn!("[comm] Could not close comm {}: {}", comm_id, e);
            }
            return;
        };

        let events = table.insert(&comm_id, target_name, data);
        drop(table);
        info!("[comm] Kernel opened comm {} for '{}'", comm_id, target_name);
        if target.send(self.comm(comm_id.clone(), target_name, events)).is_err() {
            self.table.lock().await.comms.remove(&comm_id);
        }
    }
}
