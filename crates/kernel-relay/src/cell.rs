//! Notebook cell model.

use jupyter_wire::KernelMessage;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::kernel::{ExecuteOptions, KernelError, KernelHandle};
use crate::output::OutputArea;
use crate::render::{HtmlSanitizer, MarkdownRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

/// Edit mode sends keystrokes to the editor; command mode to the notebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellMode {
    #[default]
    Command,
    Edit,
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub id: String,
    pub cell_type: CellType,
    source: String,
    pub outputs: OutputArea,
    pub execution_count: Option<u32>,
    mode: CellMode,
    rendered: bool,
    running: bool,
}

impl Cell {
    pub fn new(cell_type: CellType, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cell_type,
            source: source.into(),
            outputs: OutputArea::new(),
            execution_count: None,
            mode: CellMode::Command,
            rendered: false,
            running: false,
        }
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(CellType::Code, source)
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self::new(CellType::Markdown, source)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
        if self.cell_type == CellType::Markdown {
            self.rendered = false;
        }
    }

    pub fn mode(&self) -> CellMode {
        self.mode
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Enter edit mode. A rendered markdown cell shows its source again.
    pub fn edit(&mut self) {
        self.mode = CellMode::Edit;
        if self.cell_type == CellType::Markdown {
            self.rendered = false;
        }
    }

    pub fn command(&mut self) {
        self.mode = CellMode::Command;
    }

    /// Render a markdown cell to sanitized HTML. `None` for other cell types.
    pub fn render_markdown(
        &mut self,
        markdown: &dyn MarkdownRenderer,
        sanitizer: &dyn HtmlSanitizer,
    ) -> Option<String> {
        if self.cell_type != CellType::Markdown {
            return None;
        }
        self.rendered = true;
        Some(sanitizer.sanitize(&markdown.render(&self.source)))
    }

    pub fn input_prompt(&self) -> String {
        if self.running {
            return "In [*]:".to_string();
        }
        match self.execution_count {
            Some(n) => format!("In [{}]:", n),
            None => "In [ ]:".to_string(),
        }
    }

    /// Execute a code cell, collecting its outputs. Stdin is not offered to
    /// the kernel. Returns the `execute_reply`.
    pub async fn run(&mut self, kernel: &KernelHandle) -> Result<KernelMessage, KernelError> {
        if self.cell_type != CellType::Code {
            return Err(KernelError::InvalidRequest(format!(
                "cannot execute a {:?} cell",
                self.cell_type
            )));
        }

        self.outputs.clear();
        let options = ExecuteOptions {
            allow_stdin: false,
            ..Default::default()
        };
        let mut execution = kernel.execute(&self.source, options)?;
        let running = RunningFlag::raise(&mut self.running);

        while let Some(msg) = execution.next_output().await {
            self.outputs.handle(&msg);
        }
        let reply = execution.reply().await;
        drop(running);
        let reply = reply?;

        if let Some(count) = reply.content.get("execution_count").and_then(Value::as_u64) {
            self.execution_count = u32::try_from(count).ok();
        }
        debug!(
            "[cell] {} finished with status {}",
            self.id,
            reply.content["status"]
        );
        Ok(reply)
    }

    /// The cell as nbformat v4 JSON.
    pub fn to_nbformat(&self) -> Value {
        let mut cell = json!({
            "id": self.id,
            "cell_type": self.cell_type,
            "metadata": {},
            "source": self.source,
        });
        if self.cell_type == CellType::Code {
            cell["execution_count"] = json!(self.execution_count);
            cell["outputs"] = json!(self.outputs.outputs());
        }
        cell
    }
}

/// Lowers the running flag when dropped, even if `run` is cancelled.
struct RunningFlag<'a>(&'a mut bool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a mut bool) -> Self {
        *flag = true;
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        *self.0 = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Output;
    use crate::render::{AmmoniaSanitizer, PulldownMarkdown};

    #[test]
    fn test_prompt_states() {
        let mut cell = Cell::code("1 + 1");
        assert_eq!(cell.input_prompt(), "In [ ]:");
        cell.running = true;
        assert_eq!(cell.input_prompt(), "In [*]:");
        cell.running = false;
        cell.execution_count = Some(12);
        assert_eq!(cell.input_prompt(), "In [12]:");
    }

    #[test]
    fn test_running_flag_lowers_on_drop() {
        let mut cell = Cell::code("1 + 1");
        {
            let _running = RunningFlag::raise(&mut cell.running);
        }
        assert!(!cell.is_running());
        assert_eq!(cell.input_prompt(), "In [ ]:");
    }

    #[test]
    fn test_markdown_render_cycle() {
        let mut cell = Cell::markdown("*hi* <img src=x onerror=alert(1)>");
        let html = cell
            .render_markdown(&PulldownMarkdown, &AmmoniaSanitizer)
            .unwrap();
        assert!(html.contains("<em>hi</em>"));
        assert!(!html.contains("onerror"));
        assert!(cell.is_rendered());

        cell.edit();
        assert_eq!(cell.mode(), CellMode::Edit);
        assert!(!cell.is_rendered());

        cell.render_markdown(&PulldownMarkdown, &AmmoniaSanitizer);
        cell.command();
        cell.set_source("changed");
        assert_eq!(cell.mode(), CellMode::Command);
        assert!(!cell.is_rendered());
    }

    #[test]
    fn test_code_cells_do_not_render_markdown() {
        let mut cell = Cell::code("x = 1");
        assert!(cell
            .render_markdown(&PulldownMarkdown, &AmmoniaSanitizer)
            .is_none());
        cell.edit();
        cell.set_source("x = 2");
        assert_eq!(cell.source(), "x = 2");
    }

    #[test]
    fn test_nbformat_shape() {
        let mut cell = Cell::code("print('a')");
        cell.execution_count = Some(1);
        cell.outputs.push(Output::Stream {
            name: "stdout".into(),
            text: "a\n".into(),
        });
        let json = cell.to_nbformat();
        assert_eq!(json["cell_type"], "code");
        assert_eq!(json["execution_count"], 1);
        assert_eq!(json["outputs"][0]["output_type"], "stream");

        let md = Cell::markdown("# t").to_nbformat();
        assert!(md.get("outputs").is_none());
    }
}
