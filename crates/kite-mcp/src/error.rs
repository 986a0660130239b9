// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Errors produced by the MCP client and server manager.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Transport handshake or discovery failed.
    #[error("mcp connection failed: {0}")]
    Connection(String),

    /// The server sent a response the client cannot interpret.
    #[error("mcp protocol error: {0}")]
    Protocol(String),

    /// The OAuth flow failed (metadata, redirect, or code exchange).
    #[error("mcp oauth failed: {0}")]
    OAuth(String),

    /// A tool call was attempted outside `connected.tool_discovered`.
    #[error("mcp client {id} is not connected")]
    NotConnected { id: String },

    /// The client has been disposed; no further operations are possible.
    #[error("mcp client {id} is disposed")]
    Disposed { id: String },

    /// No tool with this name exists in the aggregated pool.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// A tool name collides with an already-registered tool.
    #[error("tool name already registered: {name}")]
    DuplicateTool { name: String },

    /// A locally-registered tool has an invalid name or an uncompilable
    /// input schema.
    #[error("invalid tool registration: {0}")]
    InvalidRegistration(String),

    /// A server id collides with an already-registered server.
    #[error("server already registered: {id}")]
    DuplicateServer { id: String },

    /// A bounded wait (connection, disposal) expired.
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    /// The in-flight operation was cancelled.
    #[error("mcp operation cancelled")]
    Cancelled,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
