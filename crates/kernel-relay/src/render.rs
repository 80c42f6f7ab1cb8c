//! Markdown rendering, HTML sanitizing and output-to-HTML conversion.
//!
//! The markdown renderer and sanitizer sit behind traits so callers can
//! swap them. The defaults are `pulldown-cmark` and `ammonia`.

use std::sync::OnceLock;

use base64::prelude::*;
use pulldown_cmark::{Options, Parser};
use regex::Regex;
use serde_json::Value;

use crate::output::{MimeBundle, Output};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("No renderable mime type among {0:?}")]
    Unsupported(Vec<String>),

    #[error("Invalid {mime} data: {reason}")]
    InvalidData { mime: String, reason: String },
}

pub trait MarkdownRenderer: Send + Sync {
    fn render(&self, markdown: &str) -> String;
}

pub trait HtmlSanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> String;
}

/// Renders one output to an HTML fragment.
pub trait Renderer {
    fn render(&self, output: &Output) -> Result<String, RenderError>;
}

/// CommonMark with tables, strikethrough and task lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulldownMarkdown;

impl MarkdownRenderer for PulldownMarkdown {
    fn render(&self, markdown: &str) -> String {
        let options = Options::ENABLE_TABLES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_TASKLISTS;
        let mut html = String::with_capacity(markdown.len() * 3 / 2);
        pulldown_cmark::html::push_html(&mut html, Parser::new_ext(markdown, options));
        html
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AmmoniaSanitizer;

impl HtmlSanitizer for AmmoniaSanitizer {
    fn sanitize(&self, html: &str) -> String {
        ammonia::clean(html)
    }
}

/// Mime types in the order a bundle is searched.
pub const MIME_PRIORITY: &[&str] = &[
    "text/html",
    "text/markdown",
    "image/svg+xml",
    "image/png",
    "image/jpeg",
    "text/latex",
    "text/plain",
];

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ANSI pattern is valid")
    })
}

/// Remove terminal color and cursor escapes.
pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").into_owned()
}

/// Bundle values are a string or a list of lines.
fn mime_text(mime: &str, value: &Value) -> Result<String, RenderError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(lines) => lines
            .iter()
            .map(|line| line.as_str())
            .collect::<Option<Vec<_>>>()
            .map(|lines| lines.concat())
            .ok_or_else(|| RenderError::InvalidData {
                mime: mime.to_string(),
                reason: "expected a list of strings".to_string(),
            }),
        other => Err(RenderError::InvalidData {
            mime: mime.to_string(),
            reason: format!("expected text, got {}", other),
        }),
    }
}

/// Renders outputs to sanitized HTML.
pub struct HtmlRenderer {
    markdown: Box<dyn MarkdownRenderer>,
    sanitizer: Box<dyn HtmlSanitizer>,
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self::new(Box::new(PulldownMarkdown), Box::new(AmmoniaSanitizer))
    }
}

impl HtmlRenderer {
    pub fn new(markdown: Box<dyn MarkdownRenderer>, sanitizer: Box<dyn HtmlSanitizer>) -> Self {
        Self {
            markdown,
            sanitizer,
        }
    }

    /// Markdown to sanitized HTML.
    pub fn markdown(&self, source: &str) -> String {
        self.sanitizer.sanitize(&self.markdown.render(source))
    }

    fn preformatted(&self, class: &str, text: &str) -> String {
        format!(
            "<pre class=\"{}\">{}</pre>",
            class,
            ammonia::clean_text(&strip_ansi(text))
        )
    }

    fn image(&self, mime: &str, encoded: &str) -> Result<String, RenderError> {
        let compact: String = encoded.split_whitespace().collect();
        BASE64_STANDARD
            .decode(&compact)
            .map_err(|e| RenderError::InvalidData {
                mime: mime.to_string(),
                reason: e.to_string(),
            })?;
        Ok(format!("<img src=\"data:{};base64,{}\">", mime, compact))
    }

    /// Render the highest-priority mime type present in `data`.
    pub fn render_bundle(&self, data: &MimeBundle) -> Result<String, RenderError> {
        let Some((mime, value)) = MIME_PRIORITY
            .iter()
            .find_map(|mime| data.get(*mime).map(|value| (*mime, value)))
        else {
            return Err(RenderError::Unsupported(data.keys().cloned().collect()));
        };

        let text = mime_text(mime, value)?;
        match mime {
            "text/html" => Ok(self.sanitizer.sanitize(&text)),
            "text/markdown" => Ok(self.markdown(&text)),
            "image/svg+xml" => Ok(format!(
                "<img src=\"data:image/svg+xml;base64,{}\">",
                BASE64_STANDARD.encode(text.as_bytes())
            )),
            "image/png" | "image/jpeg" => self.image(mime, &text),
            "text/latex" => Ok(format!(
                "<div class=\"output-latex\">{}</div>",
                ammonia::clean_text(&text)
            )),
            _ => Ok(self.preformatted("output-text", &text)),
        }
    }
}

impl Renderer for HtmlRenderer {
    fn render(&self, output: &Output) -> Result<String, RenderError> {
        match output {
            Output::Stream { name, text } => {
                Ok(self.preformatted(&format!("output-stream output-{}", name), text))
            }
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                self.render_bundle(data)
            }
            Output::Error {
                ename,
                evalue,
                traceback,
            } => {
                let text = if traceback.is_empty() {
                    format!("{}: {}", ename, evalue)
                } else {
                    traceback.join("\n")
                };
                Ok(self.preformatted("output-error", &text))
            }
        }
    }
}
