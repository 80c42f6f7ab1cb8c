//! Output area: builds nbformat outputs from a request's iopub messages.

use jupyter_wire::KernelMessage;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::render::Renderer;

/// Text shown in place of an output that failed to render.
pub const RENDER_FAILED_MARKER: &str = "Error adding output";

/// Mime type to data, e.g. `"text/plain" -> "42"`.
pub type MimeBundle = Map<String, Value>;

/// One nbformat output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: String,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(skip)]
        display_id: Option<String>,
    },
    ExecuteResult {
        execution_count: Option<u32>,
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(skip)]
        display_id: Option<String>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    fn display_id(&self) -> Option<&str> {
        match self {
            Output::DisplayData { display_id, .. } | Output::ExecuteResult { display_id, .. } => {
                display_id.as_deref()
            }
            _ => None,
        }
    }
}

/// An output after rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedOutput {
    Html(String),
    /// Rendering failed; the error is kept for diagnostics.
    Failed(String),
}

impl RenderedOutput {
    pub fn html(&self) -> String {
        match self {
            RenderedOutput::Html(html) => html.clone(),
            RenderedOutput::Failed(_) => format!(
                "<div class=\"output-render-error\">{}</div>",
                RENDER_FAILED_MARKER
            ),
        }
    }
}

#[derive(Deserialize)]
struct StreamContent {
    name: String,
    text: String,
}

#[derive(Default, Deserialize)]
struct Transient {
    #[serde(default)]
    display_id: Option<String>,
}

#[derive(Deserialize)]
struct DisplayContent {
    #[serde(default)]
    data: MimeBundle,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    transient: Transient,
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorContent {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct ClearContent {
    #[serde(default)]
    wait: bool,
}

fn parse<T: DeserializeOwned>(msg: &KernelMessage) -> Option<T> {
    match serde_json::from_value(msg.content.clone()) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!("[output] Malformed {} content: {}", msg.msg_type(), e);
            None
        }
    }
}

/// Ordered outputs of one cell.
#[derive(Debug, Clone, Default)]
pub struct OutputArea {
    outputs: Vec<Output>,
    clear_pending: bool,
}

impl OutputArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.clear_pending = false;
    }

    /// Append an output, applying a deferred clear first. Consecutive
    /// chunks of the same stream are merged.
    pub fn push(&mut self, output: Output) {
        if self.clear_pending {
            self.clear();
        }
        if let (
            Some(Output::Stream { name, text }),
            Output::Stream {
                name: new_name,
                text: new_text,
            },
        ) = (self.outputs.last_mut(), &output)
        {
            if name == new_name {
                text.push_str(new_text);
                return;
            }
        }
        self.outputs.push(output);
    }

    /// Apply one iopub message. Returns `true` if the area changed.
    pub fn handle(&mut self, msg: &KernelMessage) -> bool {
        match msg.msg_type() {
            "stream" => {
                let Some(c) = parse::<StreamContent>(msg) else {
                    return false;
                };
                self.push(Output::Stream {
                    name: c.name,
                    text: c.text,
                });
                true
            }
            "display_data" => {
                let Some(c) = parse::<DisplayContent>(msg) else {
                    return false;
                };
                self.push(Output::DisplayData {
                    data: c.data,
                    metadata: c.metadata,
                    display_id: c.transient.display_id,
                });
                true
            }
            "execute_result" => {
                let Some(c) = parse::<DisplayContent>(msg) else {
                    return false;
                };
                self.push(Output::ExecuteResult {
                    execution_count: c.execution_count,
                    data: c.data,
                    metadata: c.metadata,
                    display_id: c.transient.display_id,
                });
                true
            }
            "error" => {
                let Some(c) = parse::<ErrorContent>(msg) else {
                    return false;
                };
                self.push(Output::Error {
                    ename: c.ename,
                    evalue: c.evalue,
                    traceback: c.traceback,
                });
                true
            }
            "clear_output" => {
                let wait = parse::<ClearContent>(msg).map(|c| c.wait).unwrap_or(false);
                if wait {
                    self.clear_pending = true;
                    false
                } else {
                    let changed = !self.outputs.is_empty();
                    self.clear();
                    changed
                }
            }
            "update_display_data" => {
                let Some(c) = parse::<DisplayContent>(msg) else {
                    return false;
                };
                match c.transient.display_id {
                    Some(id) => self.update_display(&id, c.data, c.metadata) > 0,
                    None => {
                        warn!("[output] update_display_data without display_id");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Replace data and metadata of every output shown under `display_id`.
    /// Returns how many outputs were updated.
    pub fn update_display(
        &mut self,
        display_id: &str,
        new_data: MimeBundle,
        new_metadata: Map<String, Value>,
    ) -> usize {
        let mut updated = 0;
        for output in self.outputs.iter_mut() {
            if output.display_id() != Some(display_id) {
                continue;
            }
            if let Output::DisplayData { data, metadata, .. }
            | Output::ExecuteResult { data, metadata, .. } = output
            {
                *data = new_data.clone();
                *metadata = new_metadata.clone();
                updated += 1;
            }
        }
        updated
    }

    /// Render every output on its own; a failure only affects that output.
    pub fn render(&self, renderer: &dyn Renderer) -> Vec<RenderedOutput> {
        self.outputs
            .iter()
            .map(|output| match renderer.render(output) {
                Ok(html) => RenderedOutput::Html(html),
                Err(e) => {
                    warn!("[output] Failed to render output: {}", e);
                    RenderedOutput::Failed(e.to_string())
                }
            })
            .collect()
    }
}
