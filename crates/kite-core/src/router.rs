// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use kite_mcp::McpServerManager;
use kite_model::ToolDescriptor;
use kite_sandbox::ProgrammaticRouter;
use kite_tools::{ToolCaller, ToolError, ToolResult};

/// Routes sandbox tool-call RPCs into the manager's aggregated pool,
/// restricted to programmatic-callable tools.
pub struct ManagerRouter {
    manager: Arc<McpServerManager>,
}

impl ManagerRouter {
    pub fn new(manager: Arc<McpServerManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ProgrammaticRouter for ManagerRouter {
    async fn programmatic_tools(&self) -> Vec<ToolDescriptor> {
        self.manager.programmatic_tools().await
    }

    async fn call_programmatic(
        &self,
        tool_use_id: &str,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        self.manager
            .call_tool(tool_use_id, name, args, ToolCaller::Programmatic, cancel)
            .await
    }
}
