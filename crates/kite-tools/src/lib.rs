// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod schema;
mod tool;

pub use error::ToolError;
pub use schema::CompiledSchema;
pub use tool::{
    validate_tool_name, ExecuteOptions, Tool, ToolCaller, ToolContext, ToolResult,
};
