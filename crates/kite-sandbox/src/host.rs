// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Host side of the code-execution sandbox.
//!
//! Each execution spawns a fresh single-use runner process, drives the
//! stdio protocol, proxies tool-call RPCs back to the host, and enforces
//! the timeout by forcefully terminating the runner — the only hard kill
//! in the system.  Model-generated code is never trusted: the default
//! runner is `deno run` with no permission flags, so the isolate has no
//! filesystem, network, env, or subprocess authority.

use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    protocol::{ControllerMessage, ExecutionResult, RunnerMessage, ToolDefinition},
    tool::ProgrammaticRouter,
};

/// The embedded TypeScript runner, written to a temp file at spawn time.
const RUNNER_SCRIPT: &str = include_str!("../runner/runner.ts");

/// The only language the runner accepts.
const LANGUAGE_TYPESCRIPT: &str = "typescript";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    #[error("failed to spawn sandbox runner: {0}")]
    Spawn(String),

    #[error("sandbox protocol error: {0}")]
    Protocol(String),

    #[error("sandbox execution cancelled")]
    Cancelled,
}

/// Sandbox configuration.  The runner command is replaceable so embedders
/// can substitute another isolate honoring the same protocol; `None`
/// materializes the embedded Deno runner.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub runner_command: Option<Vec<String>>,
    /// Default per-execution timeout.
    pub timeout: Duration,
    /// Upper bound for caller-supplied timeouts.
    pub max_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runner_command: None,
            timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
        }
    }
}

/// One execution request.
#[derive(Debug, Clone)]
pub struct ExecuteCodeRequest {
    pub language: String,
    pub code: String,
    /// Overrides the configured timeout, clamped to `max_timeout`.
    pub timeout: Option<Duration>,
}

pub struct SandboxHost {
    config: SandboxConfig,
}

impl SandboxHost {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Execute one code payload in a fresh runner.
    ///
    /// Tool calls arriving from the runner are dispatched immediately on
    /// their own tasks; the runner may keep multiple calls outstanding
    /// and responses are matched by `callId`, not by order.
    pub async fn execute(
        &self,
        req: ExecuteCodeRequest,
        tool_definitions: Vec<ToolDefinition>,
        router: Arc<dyn ProgrammaticRouter>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if req.language != LANGUAGE_TYPESCRIPT {
            return Err(SandboxError::UnsupportedLanguage {
                language: req.language,
            });
        }
        let timeout = req
            .timeout
            .unwrap_or(self.config.timeout)
            .min(self.config.max_timeout);

        // `_script` must outlive the child: the default runner reads it
        // from disk on startup.
        let (mut child, _script) = self.spawn_runner()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("runner stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("runner stdout unavailable".into()))?;
        let mut writer = FramedWrite::new(stdin, LinesCodec::new());
        let mut reader = FramedRead::new(stdout, LinesCodec::new());

        let execute = ControllerMessage::Execute {
            language: req.language,
            code: req.code,
            tool_definitions: tool_definitions.clone(),
        };
        writer
            .send(encode(&execute)?)
            .await
            .map_err(|e| SandboxError::Protocol(format!("failed to send execute: {e}")))?;

        // Responses produced by concurrently-dispatched tool calls funnel
        // through this channel back onto the single writer.
        let (resp_tx, mut resp_rx) = mpsc::channel::<ControllerMessage>(16);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill_runner(&mut child).await;
                    return Err(SandboxError::Cancelled);
                }
                _ = &mut deadline => {
                    warn!("sandbox execution exceeded {timeout:?}; killing runner");
                    kill_runner(&mut child).await;
                    return Ok(ExecutionResult::timed_out(vec![]));
                }
                Some(resp) = resp_rx.recv() => {
                    writer
                        .send(encode(&resp)?)
                        .await
                        .map_err(|e| SandboxError::Protocol(format!("failed to send tool response: {e}")))?;
                }
                line = reader.next() => {
                    match line {
                        None => {
                            kill_runner(&mut child).await;
                            return Ok(ExecutionResult {
                                success: false,
                                data: None,
                                error: Some("runner exited without producing a result".into()),
                                logs: vec![],
                                timed_out: false,
                            });
                        }
                        Some(Err(e)) => {
                            kill_runner(&mut child).await;
                            return Err(SandboxError::Protocol(format!("runner stdout failed: {e}")));
                        }
                        Some(Ok(line)) => {
                            match serde_json::from_str::<RunnerMessage>(&line) {
                                Ok(RunnerMessage::Result { success, data, error, logs, timed_out }) => {
                                    reap_runner(&mut child).await;
                                    return Ok(ExecutionResult { success, data, error, logs, timed_out });
                                }
                                Ok(RunnerMessage::ToolCall { call_id, tool_name, args }) => {
                                    dispatch_tool_call(
                                        call_id,
                                        tool_name,
                                        args,
                                        &tool_definitions,
                                        Arc::clone(&router),
                                        cancel.child_token(),
                                        resp_tx.clone(),
                                    );
                                }
                                Err(e) => {
                                    kill_runner(&mut child).await;
                                    return Err(SandboxError::Protocol(format!(
                                        "unparseable runner message {line:?}: {e}"
                                    )));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn spawn_runner(&self) -> Result<(Child, Option<tempfile::NamedTempFile>), SandboxError> {
        let (program, args, script) = match &self.config.runner_command {
            Some(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| SandboxError::Spawn("runner command is empty".into()))?;
                (program.clone(), args.to_vec(), None)
            }
            None => {
                let mut file = tempfile::Builder::new()
                    .prefix("kite-runner-")
                    .suffix(".ts")
                    .tempfile()
                    .map_err(|e| SandboxError::Spawn(format!("temp script: {e}")))?;
                file.write_all(RUNNER_SCRIPT.as_bytes())
                    .map_err(|e| SandboxError::Spawn(format!("temp script: {e}")))?;
                let path = file.path().to_string_lossy().into_owned();
                // No permission flags: no fs/net/env/subprocess authority.
                (
                    "deno".to_string(),
                    vec!["run".into(), "--quiet".into(), "--no-prompt".into(), path],
                    Some(file),
                )
            }
        };

        debug!(%program, ?args, "spawning sandbox runner");
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{program}: {e}")))?;
        Ok((child, script))
    }
}

fn encode(msg: &ControllerMessage) -> Result<String, SandboxError> {
    serde_json::to_string(msg).map_err(|e| SandboxError::Protocol(e.to_string()))
}

/// Forceful termination: the only hard kill in the system.
async fn kill_runner(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Give a finished runner a moment to exit on its own, then kill it.
async fn reap_runner(child: &mut Child) {
    if tokio::time::timeout(Duration::from_secs(2), child.wait())
        .await
        .is_err()
    {
        kill_runner(child).await;
    }
}

fn dispatch_tool_call(
    call_id: String,
    tool_name: String,
    args: serde_json::Value,
    tool_definitions: &[ToolDefinition],
    router: Arc<dyn ProgrammaticRouter>,
    cancel: CancellationToken,
    resp_tx: mpsc::Sender<ControllerMessage>,
) {
    let allowed = tool_definitions.iter().any(|d| d.name == tool_name);
    tokio::spawn(async move {
        let msg = if !allowed {
            ControllerMessage::ToolResponse {
                call_id,
                result: None,
                error: Some(format!("tool {tool_name} is not available in this sandbox")),
            }
        } else {
            match router
                .call_programmatic(&call_id, &tool_name, args, cancel)
                .await
            {
                Ok(result) => ControllerMessage::ToolResponse {
                    call_id,
                    result: Some(crate::tool::tool_result_to_value(&result)),
                    error: None,
                },
                Err(e) => ControllerMessage::ToolResponse {
                    call_id,
                    result: None,
                    error: Some(e.to_string()),
                },
            }
        };
        let _ = resp_tx.send(msg).await;
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
//
// The real Deno runner is exercised end-to-end by embedders; these tests
// drive the host against small `sh` fakes speaking the same protocol so
// they run anywhere with a POSIX shell.
