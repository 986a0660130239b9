// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use kite_model::{Message, Usage};
use kite_tools::ToolResult;

use crate::TaskEventId;

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Timeout,
}

/// Events emitted by the agent during a single task.
/// Consumers (HTTP/WS transports, UIs) subscribe to these to drive their
/// output; heartbeats are a transport concern and never appear here.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A text chunk streamed from the model.
    Text { text: String },
    /// The model opened a tool_use block (emitted once per id).
    ToolUse { tool_use_id: String, name: String },
    /// Incremental JSON for a tool_use block's input.
    ToolUseInput {
        tool_use_id: String,
        name: String,
        partial_json: String,
    },
    /// A tool call finished; carries the normalized result (which may be
    /// an `is_error` result the model is expected to recover from).
    ToolUseResult {
        tool_use_id: String,
        name: String,
        result: ToolResult,
    },
    /// A tool call was aborted by the cancellation signal.  The task
    /// stops after this event.
    ToolUseError {
        tool_use_id: String,
        name: String,
        message: String,
    },
    /// A message was appended to the history (the seeded user message,
    /// each assistant message, each synthesized tool-result message).
    Message { message: Message },
    /// Token usage reported by the provider for one turn.
    Usage { usage: Usage },
    /// The task finished normally.
    Completed,
    /// The task was cancelled.
    Cancelled { reason: CancelReason },
    /// The run-slot was released; the history is stable again.
    HistoryChanged,
}

/// A task event tagged with its totally ordered id.
#[derive(Debug, Clone)]
pub struct TaskEventEnvelope {
    pub event_id: TaskEventId,
    pub event: TaskEvent,
}
