// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use kite_model::ToolResultBlock;

use crate::ToolError;

/// Who is invoking a tool.
///
/// `Direct` calls originate from the model's own turn; `Programmatic`
/// calls originate from inside a code-execution sandbox.  A tool declares
/// which callers it accepts; the default is direct-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCaller {
    Direct,
    Programmatic,
}

/// Per-invocation context handed to `execute`.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The tool_use id this invocation answers (or a synthetic id for
    /// programmatic calls).
    pub tool_use_id: String,
    pub caller: ToolCaller,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Tools must honor this token by aborting blocking operations and
    /// returning [`ToolError::Aborted`].
    pub cancel: CancellationToken,
}

/// The normalized result of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: Vec<ToolResultBlock>,
    pub is_error: bool,
    pub structured_content: Option<Value>,
}

impl ToolResult {
    /// Successful plain-text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::text(text)],
            is_error: false,
            structured_content: None,
        }
    }

    /// Error result containing a plain-text message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::text(message)],
            is_error: true,
            structured_content: None,
        }
    }

    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured_content = Some(value);
        self
    }

    /// Concatenated text of all text parts.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ToolResultBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<String> for ToolResult {
    fn from(s: String) -> Self {
        Self::text(s)
    }
}

impl From<&str> for ToolResult {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

/// Trait every callable capability implements — locally-defined tools,
/// MCP-sourced tools, and the code-execution tool alike.
///
/// Callers validate `input` against [`Tool::input_schema`] before
/// invoking `execute`; a schema failure never reaches the tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, `[a-zA-Z0-9_-]+`.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    /// Optional JSON Schema for `structured_content` in results.
    fn output_schema(&self) -> Option<Value> {
        None
    }
    /// Callers this tool accepts.  Default: direct only.
    fn allowed_callers(&self) -> &[ToolCaller] {
        &[ToolCaller::Direct]
    }
    /// Execute the tool.  Must honor `opts.cancel`.
    async fn execute(
        &self,
        input: Value,
        ctx: &ToolContext,
        opts: ExecuteOptions,
    ) -> Result<ToolResult, ToolError>;
}

/// Check a tool name against `^[a-zA-Z0-9_-]+$`.
pub fn validate_tool_name(name: &str) -> Result<(), ToolError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(ToolError::Name {
            name: name.to_string(),
            message: "must match [a-zA-Z0-9_-]+".into(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
