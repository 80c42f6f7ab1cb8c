//! Registry of in-flight requests and their completion channels.
//!
//! Each request registers a [`Callbacks`] record under its `msg_id`. A
//! request has two completion categories:
//!
//! - **shell**: the single reply on the shell channel
//! - **iopub**: the stream of side effects, finished by an `idle` status
//!   whose parent is the request
//!
//! A record is evicted only when every category it registered has
//! resolved, so output that arrives after the reply still finds its
//! stream. The reply is a `oneshot` that can be taken at most once, and the
//! iopub stream ends when its sender is dropped, so each category resolves
//! exactly once.
//!
//! The registry is owned by the transport task and is never shared.

use std::collections::HashMap;

use jupyter_wire::KernelMessage;
use tokio::sync::{mpsc, oneshot};

/// Completion categories tracked per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Shell,
    IOPub,
}

/// Channels a request wants its responses delivered to.
#[derive(Debug)]
pub struct Callbacks {
    /// Receives the shell reply.
    pub reply: Option<oneshot::Sender<KernelMessage>>,
    /// Receives iopub messages parented to the request, including status.
    pub iopub: Option<mpsc::UnboundedSender<KernelMessage>>,
    /// Receives stdin `input_request`s.
    pub input: Option<mpsc::UnboundedSender<KernelMessage>>,
    /// Evict the record once all categories have resolved.
    pub clear_on_done: bool,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            reply: None,
            iopub: None,
            input: None,
            clear_on_done: true,
        }
    }
}

impl Callbacks {
    /// Callbacks that only wait for the shell reply.
    pub fn reply_only(reply: oneshot::Sender<KernelMessage>) -> Self {
        Self {
            reply: Some(reply),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct CallbackRecord {
    callbacks: Callbacks,
    shell_done: bool,
    iopub_done: bool,
}

impl CallbackRecord {
    fn is_done(&self) -> bool {
        self.shell_done && self.iopub_done
    }
}

/// In-flight requests keyed by `msg_id`.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    records: HashMap<String, CallbackRecord>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks for a request. Categories without a channel start
    /// out resolved. Re-registering an id replaces the previous record.
    pub fn register(&mut self, msg_id: &str, callbacks: Callbacks) {
        let record = CallbackRecord {
            shell_done: callbacks.reply.is_none(),
            iopub_done: callbacks.iopub.is_none(),
            callbacks,
        };
        if record.is_done() && record.callbacks.input.is_none() {
            return;
        }
        self.records.insert(msg_id.to_string(), record);
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.records.contains_key(msg_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take the reply sender. Returns `None` if there is no record, no reply
    /// channel was registered, or it was already taken.
    pub fn take_reply(&mut self, msg_id: &str) -> Option<oneshot::Sender<KernelMessage>> {
        self.records
            .get_mut(msg_id)
            .and_then(|r| r.callbacks.reply.take())
    }

    /// The iopub stream for a request that has not finished its iopub phase.
    pub fn iopub(&self, msg_id: &str) -> Option<&mpsc::UnboundedSender<KernelMessage>> {
        self.records
            .get(msg_id)
            .and_then(|r| r.callbacks.iopub.as_ref())
    }

    pub fn input(&self, msg_id: &str) -> Option<&mpsc::UnboundedSender<KernelMessage>> {
        self.records
            .get(msg_id)
            .and_then(|r| r.callbacks.input.as_ref())
    }

    /// Mark one category as resolved. Returns `true` if the record was
    /// evicted as a result.
    pub fn resolve_partial(&mut self, msg_id: &str, category: Category) -> bool {
        let Some(record) = self.records.get_mut(msg_id) else {
            return false;
        };

        match category {
            Category::Shell => {
                record.shell_done = true;
                record.callbacks.reply = None;
            }
            Category::IOPub => {
                record.iopub_done = true;
                // Dropping the sender ends the consumer's stream.
                record.callbacks.iopub = None;
            }
        }

        if record.is_done() && record.callbacks.clear_on_done {
            self.records.remove(msg_id);
            return true;
        }
        false
    }

    /// Drop one record without invoking anything.
    pub fn clear(&mut self, msg_id: &str) -> bool {
        self.records.remove(msg_id).is_some()
    }

    /// Drop every pending record. Consumers observe closed channels.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        count
    }
}
