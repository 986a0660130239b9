// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use kite_model::HistoryError;

/// Errors that terminate a task (or prevent it from starting).
///
/// Conversational failures — invalid tool input, a tool that threw — are
/// not here: those become `is_error` tool results and the loop continues.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The agent's run-slot is held by another task.
    #[error("a task is already running on this agent")]
    TaskAlreadyRunning,

    /// The model provider stream failed.
    #[error("model provider failed: {0}")]
    Provider(String),

    /// The model kept calling tools past the configured turn limit.
    #[error("turn limit of {0} reached")]
    TurnLimit(u32),

    /// The conversation history violated alternation or pairing.
    #[error(transparent)]
    History(#[from] HistoryError),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
