// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kite_model::{ToolDescriptor, ToolResultBlock};
use kite_tools::{ExecuteOptions, Tool, ToolContext, ToolError, ToolResult};

use crate::{
    host::{ExecuteCodeRequest, SandboxConfig, SandboxError, SandboxHost},
    protocol::ToolDefinition,
};

/// Routes tool calls arriving from inside a sandbox back to the
/// aggregated tool pool, restricted to programmatic-callable tools.
/// Implemented by the embedding layer over its server manager.
#[async_trait]
pub trait ProgrammaticRouter: Send + Sync {
    async fn programmatic_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_programmatic(
        &self,
        tool_use_id: &str,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError>;
}

/// Serialize a tool result for the runner-side proxy.  The shape mirrors
/// the conversation-level tool_result payload, so sandboxed code reads
/// `result.content[0].text` the same way the model does.
pub(crate) fn tool_result_to_value(result: &ToolResult) -> Value {
    let content: Vec<Value> = result
        .content
        .iter()
        .map(|block| match block {
            ToolResultBlock::Text { text } => json!({"type": "text", "text": text}),
            ToolResultBlock::Image { media_type, data } => {
                json!({"type": "image", "mediaType": media_type, "data": data})
            }
        })
        .collect();
    let mut value = json!({"content": content, "isError": result.is_error});
    if let Some(structured) = &result.structured_content {
        value["structuredContent"] = structured.clone();
    }
    value
}

/// The built-in `execute_code` tool: spawns a single-use sandbox runner
/// per invocation and exposes the pool's programmatic tools to the
/// generated code through the tool-call RPC proxy.
pub struct ExecuteCodeTool {
    host: SandboxHost,
    router: Arc<dyn ProgrammaticRouter>,
}

impl ExecuteCodeTool {
    pub fn new(config: SandboxConfig, router: Arc<dyn ProgrammaticRouter>) -> Self {
        Self {
            host: SandboxHost::new(config),
            router,
        }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn description(&self) -> &str {
        "Execute TypeScript code in an isolated sandbox. The code runs as the body of \
         `async function (tools)` and its return value becomes the result. Tools listed \
         for the sandbox are callable as `await tools.<name>(args)`. Console output is \
         captured and returned alongside the result."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "language": {
                    "type": "string",
                    "description": "Language of the code; only \"typescript\" is supported."
                },
                "code": {
                    "type": "string",
                    "description": "Body of an async function receiving the tools proxy."
                },
                "timeoutMs": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Optional execution timeout in milliseconds."
                }
            },
            "required": ["language", "code"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        input: Value,
        _ctx: &ToolContext,
        opts: ExecuteOptions,
    ) -> Result<ToolResult, ToolError> {
        let language = input["language"].as_str().unwrap_or_default().to_string();
        let code = input["code"].as_str().unwrap_or_default().to_string();
        let timeout = input["timeoutMs"]
            .as_u64()
            .map(Duration::from_millis);

        let definitions: Vec<ToolDefinition> = self
            .router
            .programmatic_tools()
            .await
            .into_iter()
            .map(|d| ToolDefinition {
                name: d.name,
                description: d.description,
                input_schema: d.input_schema,
            })
            .collect();

        let outcome = self
            .host
            .execute(
                ExecuteCodeRequest {
                    language,
                    code,
                    timeout,
                },
                definitions,
                Arc::clone(&self.router),
                opts.cancel,
            )
            .await;

        match outcome {
            Ok(res) => {
                let mut text = if res.success {
                    match &res.data {
                        Some(Value::String(s)) => s.clone(),
                        Some(v) => v.to_string(),
                        None => "null".to_string(),
                    }
                } else if res.timed_out {
                    res.error
                        .clone()
                        .unwrap_or_else(|| "execution timed out".into())
                } else {
                    res.error
                        .clone()
                        .unwrap_or_else(|| "execution failed".into())
                };
                if !res.logs.is_empty() {
                    text.push_str("\n\nLogs:\n");
                    text.push_str(&res.logs.join("\n"));
                }
                Ok(ToolResult {
                    content: vec![ToolResultBlock::text(text)],
                    is_error: !res.success,
                    structured_content: res.data,
                })
            }
            Err(SandboxError::UnsupportedLanguage { language }) => Ok(ToolResult::error(
                format!("unsupported language: {language}; only \"typescript\" is supported"),
            )),
            Err(SandboxError::Cancelled) => Err(ToolError::Aborted),
            Err(e) => Err(ToolError::Execution {
                message: e.to_string(),
            }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
