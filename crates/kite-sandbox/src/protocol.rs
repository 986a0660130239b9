// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Wire messages ───────────────────────────────────────────────────────────
//
// Newline-delimited JSON over the runner's stdio.  Field names are
// camelCase because the runner side of the protocol is a TypeScript
// process.

/// A tool exposed to the sandboxed code.  The runner synthesizes one
/// proxy method per definition; nothing outside this list is reachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Controller → runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    #[serde(rename_all = "camelCase")]
    Execute {
        language: String,
        code: String,
        tool_definitions: Vec<ToolDefinition>,
    },
    #[serde(rename_all = "camelCase")]
    ToolResponse {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Runner → controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    #[serde(rename_all = "camelCase")]
    ToolCall {
        call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        success: bool,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        logs: Vec<String>,
        #[serde(default)]
        timed_out: bool,
    },
}

/// The outcome of one sandbox execution as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Console output in arrival order, non-`log` levels prefixed
    /// (`[INFO] …`, `[WARN] …`).
    pub logs: Vec<String>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub(crate) fn timed_out(logs: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some("execution timed out".into()),
            logs,
            timed_out: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn execute_message_uses_camel_case_fields() {
        let msg = ControllerMessage::Execute {
            language: "typescript".into(),
            code: "return 1;".into(),
            tool_definitions: vec![ToolDefinition {
                name: "echo".into(),
                description: "echoes".into(),
                input_schema: json!({"type": "object"}),
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"execute""#));
        assert!(json.contains(r#""toolDefinitions""#));
        assert!(json.contains(r#""inputSchema""#));
    }

    #[test]
    fn tool_call_parses_from_runner_wire_format() {
        let line = r#"{"type":"tool_call","callId":"c-1","toolName":"echo","args":{"text":"x"}}"#;
        let msg: RunnerMessage = serde_json::from_str(line).unwrap();
        assert_eq!(
            msg,
            RunnerMessage::ToolCall {
                call_id: "c-1".into(),
                tool_name: "echo".into(),
                args: json!({"text": "x"}),
            }
        );
    }

    #[test]
    fn result_defaults_optional_fields() {
        let line = r#"{"type":"result","success":true,"data":"done"}"#;
        let msg: RunnerMessage = serde_json::from_str(line).unwrap();
        match msg {
            RunnerMessage::Result {
                success,
                data,
                error,
                logs,
                timed_out,
            } => {
                assert!(success);
                assert_eq!(data, Some(json!("done")));
                assert!(error.is_none());
                assert!(logs.is_empty());
                assert!(!timed_out);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn result_timed_out_round_trip() {
        let line = r#"{"type":"result","success":false,"timedOut":true,"logs":["[WARN] slow"]}"#;
        let msg: RunnerMessage = serde_json::from_str(line).unwrap();
        assert!(matches!(
            msg,
            RunnerMessage::Result { timed_out: true, success: false, .. }
        ));
    }

    #[test]
    fn tool_response_omits_absent_fields() {
        let msg = ControllerMessage::ToolResponse {
            call_id: "c-2".into(),
            result: Some(json!({"content": []})),
            error: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""callId":"c-2""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn tool_response_error_round_trip() {
        let msg = ControllerMessage::ToolResponse {
            call_id: "c-3".into(),
            result: None,
            error: Some("tool failed".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControllerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
