// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Errors a tool invocation can produce.
///
/// `InvalidInput` and `Execution` are conversational: the agent loop turns
/// them into `is_error` tool results so the model can self-correct.
/// `Aborted` breaks the conversation and cancels the running task.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The input failed JSON-schema validation; `execute` never ran.
    #[error("invalid tool input: {message}")]
    InvalidInput { message: String },

    /// The tool's execute failed.
    #[error("tool execution failed: {message}")]
    Execution { message: String },

    /// The cancellation signal fired during execute.
    #[error("tool execution aborted")]
    Aborted,

    /// The tool's declared input schema is not a valid JSON Schema.
    /// Raised at registration time, never during a call.
    #[error("invalid tool schema: {message}")]
    Schema { message: String },

    /// The tool name violates `[a-zA-Z0-9_-]+` or collides with an
    /// already-registered name.
    #[error("invalid tool name {name:?}: {message}")]
    Name { name: String, message: String },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// True for errors the agent loop converts into `is_error` tool
    /// results rather than aborting the task.
    pub fn is_conversational(&self) -> bool {
        matches!(self, Self::InvalidInput { .. } | Self::Execution { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
