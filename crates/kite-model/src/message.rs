// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content block types ─────────────────────────────────────────────────────

/// A single block inside a message's content list.
///
/// Assistant turns carry `Text` and `ToolUse` blocks; user turns carry
/// `Text`, `Image` and `ToolResult` blocks.  Tool results always live in
/// the user turn immediately following the assistant turn that requested
/// them, paired by `tool_use_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ToolResultBlock>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured_content: Option<Value>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            tool_use_id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// A single content part inside a tool result.  Tool output is restricted
/// to text and images; nested tool calls are not representable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

impl ToolResultBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ─── Message types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// User message from arbitrary blocks (text + images).
    pub fn user_with_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    /// Plain-text assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Assistant message from arbitrary blocks (text + tool_use).
    pub fn assistant_with_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// User message carrying one tool_result block per executed tool call.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All `ToolUse` blocks in document order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse {
                    tool_use_id,
                    name,
                    input,
                } => Some((tool_use_id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    /// Ids of all `ToolResult` blocks in document order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ─── History validation ──────────────────────────────────────────────────────

/// A structural defect in a conversation history.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("message {index} and its successor have the same role")]
    BrokenAlternation { index: usize },
    #[error("tool_use {tool_use_id} in message {index} has no matching tool_result")]
    UnmatchedToolUse { index: usize, tool_use_id: String },
    #[error("tool_result {tool_use_id} in message {index} has no matching tool_use")]
    UnmatchedToolResult { index: usize, tool_use_id: String },
    #[error("tool_result order in message {index} does not match the preceding tool_use order")]
    ResultOrderMismatch { index: usize },
}

/// Check the two hard invariants of a history:
///
/// 1. strict user/assistant alternation — two same-role messages never
///    adjoin;
/// 2. every `tool_use` block in assistant message N is paired with exactly
///    one `tool_result` block of the same id in user message N+1, in the
///    same order, and user messages carry no tool_result that was never
///    requested.
pub fn validate_history(messages: &[Message]) -> Result<(), HistoryError> {
    for (i, pair) in messages.windows(2).enumerate() {
        if pair[0].role == pair[1].role {
            return Err(HistoryError::BrokenAlternation { index: i });
        }
    }

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                let uses: Vec<&str> = msg.tool_uses().iter().map(|(id, _, _)| *id).collect();
                if uses.is_empty() {
                    continue;
                }
                let results: Vec<&str> = messages
                    .get(i + 1)
                    .map(|m| m.tool_result_ids())
                    .unwrap_or_default();
                for id in &uses {
                    if !results.contains(id) {
                        return Err(HistoryError::UnmatchedToolUse {
                            index: i,
                            tool_use_id: id.to_string(),
                        });
                    }
                }
                if uses.len() == results.len() && uses != results {
                    return Err(HistoryError::ResultOrderMismatch { index: i + 1 });
                }
            }
            Role::User => {
                let results = msg.tool_result_ids();
                if results.is_empty() {
                    continue;
                }
                let uses: Vec<&str> = if i == 0 {
                    vec![]
                } else {
                    messages[i - 1].tool_uses().iter().map(|(id, _, _)| *id).collect()
                };
                for id in &results {
                    if !uses.contains(id) {
                        return Err(HistoryError::UnmatchedToolResult {
                            index: i,
                            tool_use_id: id.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
