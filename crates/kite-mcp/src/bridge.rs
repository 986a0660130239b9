// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pure conversions between MCP wire shapes and kite's tool types.
//!
//! These are stateless functions — no allocation beyond what the output
//! types require.  The bridge sits at the seam between the MCP SDK
//! surface and [`kite_tools`] so neither side needs to know about the
//! other.

use serde_json::Value;

use kite_model::ToolResultBlock;
use kite_tools::ToolResult;

use crate::McpError;

/// Normalize a raw `tools/call` result value into a [`ToolResult`].
///
/// Two shapes are accepted:
/// - the current MCP shape `{content: […], isError?, structuredContent?}`;
/// - the legacy SDK shape `{toolResult: any}`, coerced to a single text
///   block containing the JSON-stringified value.
///
/// Anything else is a protocol error.
pub fn normalize_tool_result(raw: Value) -> Result<ToolResult, McpError> {
    let Value::Object(map) = raw else {
        return Err(McpError::Protocol(format!(
            "tool result is not an object: {raw}"
        )));
    };

    if let Some(content) = map.get("content") {
        let Value::Array(items) = content else {
            return Err(McpError::Protocol("content is not an array".into()));
        };
        let blocks = items.iter().map(content_item_to_block).collect();
        let is_error = map
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let structured_content = map
            .get("structuredContent")
            .filter(|v| !v.is_null())
            .cloned();
        return Ok(ToolResult {
            content: blocks,
            is_error,
            structured_content,
        });
    }

    if let Some(legacy) = map.get("toolResult") {
        let text = serde_json::to_string(legacy)
            .map_err(|e| McpError::Protocol(format!("unserializable toolResult: {e}")))?;
        return Ok(ToolResult::text(text));
    }

    Err(McpError::Protocol(format!(
        "unrecognized tool result shape: {}",
        Value::Object(map)
    )))
}

/// Convert one MCP content item to a result block.  Text and image items
/// map directly; anything else is preserved as its JSON text so no
/// information is silently dropped.
fn content_item_to_block(item: &Value) -> ToolResultBlock {
    match item.get("type").and_then(Value::as_str) {
        Some("text") => ToolResultBlock::Text {
            text: item
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Some("image") => ToolResultBlock::Image {
            media_type: item
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
            data: item
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        _ => ToolResultBlock::Text {
            text: item.to_string(),
        },
    }
}

/// Prefix a server-side tool name with its server id so it is globally
/// addressable in the aggregated pool.
pub fn prefixed_tool_name(server_id: &str, tool_name: &str) -> String {
    format!("{server_id}_{tool_name}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
