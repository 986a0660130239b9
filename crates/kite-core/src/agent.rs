// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The task executor: drives provider turns, routes tool calls through
//! the MCP manager, and publishes a replayable task event stream.
//!
//! Concurrency model: one task at a time per agent (the run-slot), claimed
//! atomically at `run_task` and released on every exit path.  The loop
//! itself runs on a spawned tokio task; after the initial claim succeeds,
//! every failure arrives on the event stream, never as a panic or a
//! synchronous error.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use kite_mcp::McpServerManager;
use kite_model::{
    validate_history, ChatEvent, ChatRequest, ContentBlock, Message, ModelProvider, Role,
    ToolResultBlock,
};
use kite_sandbox::{ExecuteCodeTool, SandboxConfig};
use kite_tools::{ToolCaller, ToolError};

use crate::{
    events::{CancelReason, TaskEvent, TaskEventEnvelope},
    router::ManagerRouter,
    stream::ReplaySubject,
    TaskError, TaskEventId,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Max output tokens requested from the provider per turn.
    pub max_tokens: u32,
    /// Hard ceiling on provider turns per task; a model that keeps
    /// calling tools past this terminates the task with
    /// [`TaskError::TurnLimit`].
    pub max_turns: u32,
    /// When set, a running task is cancelled with reason `timeout` after
    /// this duration.
    pub task_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_tokens: 4096,
            max_turns: 50,
            task_timeout: None,
        }
    }
}

/// The user turn that seeds a task: text plus optional image attachments.
#[derive(Debug, Clone)]
pub struct TaskPrompt {
    pub text: String,
    pub images: Vec<ContentBlock>,
}

impl TaskPrompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: vec![],
        }
    }

    pub fn with_image(mut self, media_type: impl Into<String>, data: impl Into<String>) -> Self {
        self.images.push(ContentBlock::Image {
            media_type: media_type.into(),
            data: data.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunTaskOptions {
    /// Caller-side cancellation; chained into the task's own token.
    pub cancel: Option<CancellationToken>,
}

/// Handle to a running (or finished) task.
#[derive(Clone)]
pub struct TaskHandle {
    pub task_id: String,
    subject: ReplaySubject,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// The task's event stream; buffered events replay first, so a late
    /// subscriber sees the full sequence.
    pub fn events(
        &self,
    ) -> impl futures::Stream<Item = Result<TaskEventEnvelope, Arc<TaskError>>> + Send + Unpin
    {
        self.subject.subscribe()
    }

    /// Resume past a `last_event_id` (reconnecting consumers).
    pub fn events_after(
        &self,
        last_event_id: TaskEventId,
    ) -> impl futures::Stream<Item = Result<TaskEventEnvelope, Arc<TaskError>>> + Send + Unpin
    {
        self.subject.subscribe_after(last_event_id)
    }

    /// Cancel this task (reason `user`).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct CurrentTask {
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

struct AgentInner {
    config: AgentConfig,
    model: Arc<dyn ModelProvider>,
    mcp: Arc<McpServerManager>,
    messages: Mutex<Vec<Message>>,
    running: AtomicBool,
    current: Mutex<Option<CurrentTask>>,
}

/// The core agent.  Owns the conversation history and drives the
/// model ↔ tool loop; cheap to clone and share.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        model: Arc<dyn ModelProvider>,
        mcp: Arc<McpServerManager>,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                config,
                model,
                mcp,
                messages: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn mcp(&self) -> &Arc<McpServerManager> {
        &self.inner.mcp
    }

    /// Register the built-in `execute_code` tool, wired to this agent's
    /// manager for programmatic tool routing.
    pub async fn install_execute_code(&self, config: SandboxConfig) -> Result<(), kite_mcp::McpError> {
        let router = Arc::new(ManagerRouter::new(Arc::clone(&self.inner.mcp)));
        self.inner
            .mcp
            .register_tool(Arc::new(ExecuteCodeTool::new(config, router)))
            .await
    }

    /// Snapshot of the conversation history.  Messages accumulate across
    /// tasks until explicitly cleared.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.lock().expect("messages poisoned").clone()
    }

    /// Clear the history.  Rejected while a task holds the run-slot.
    pub fn clear_messages(&self) -> Result<(), TaskError> {
        if self.is_task_running() {
            return Err(TaskError::TaskAlreadyRunning);
        }
        self.inner.messages.lock().expect("messages poisoned").clear();
        Ok(())
    }

    pub fn is_task_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Cancel the running task, if any.
    pub fn cancel_task(&self, reason: CancelReason) {
        let current = self.inner.current.lock().expect("current poisoned");
        if let Some(task) = current.as_ref() {
            *task.reason.lock().expect("reason poisoned") = Some(reason);
            task.cancel.cancel();
        }
    }

    /// Start a task.  Fails fast with [`TaskError::TaskAlreadyRunning`]
    /// when the run-slot is held; after the claim succeeds, all failures
    /// arrive on the returned handle's event stream.
    pub fn run_task(
        &self,
        prompt: TaskPrompt,
        opts: RunTaskOptions,
    ) -> Result<TaskHandle, TaskError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TaskError::TaskAlreadyRunning);
        }

        let cancel = opts
            .cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let reason = Arc::new(Mutex::new(None));
        *self.inner.current.lock().expect("current poisoned") = Some(CurrentTask {
            cancel: cancel.clone(),
            reason: Arc::clone(&reason),
        });

        if let Some(timeout) = self.inner.config.task_timeout {
            let token = cancel.clone();
            let reason = Arc::clone(&reason);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        *reason.lock().expect("reason poisoned") = Some(CancelReason::Timeout);
                        token.cancel();
                    }
                }
            });
        }

        let subject = ReplaySubject::new();
        let handle = TaskHandle {
            task_id: Uuid::new_v4().to_string(),
            subject: subject.clone(),
            cancel: cancel.clone(),
        };

        let inner = Arc::clone(&self.inner);
        let task_id = handle.task_id.clone();
        tokio::spawn(async move {
            debug!(%task_id, "task started");
            let outcome = task_loop(&inner, prompt, &subject, &cancel, &reason).await;
            match outcome {
                Ok(Outcome::Completed) => {
                    subject.publish(TaskEvent::Completed);
                }
                Ok(Outcome::Cancelled(reason)) => {
                    subject.publish(TaskEvent::Cancelled { reason });
                }
                Err(e) => {
                    warn!(%task_id, error = %e, "task failed");
                    subject.publish(TaskEvent::HistoryChanged);
                    release(&inner);
                    subject.fail(e);
                    return;
                }
            }
            subject.publish(TaskEvent::HistoryChanged);
            release(&inner);
            subject.complete();
            debug!(%task_id, "task finished");
        });

        Ok(handle)
    }
}

fn release(inner: &AgentInner) {
    *inner.current.lock().expect("current poisoned") = None;
    inner.running.store(false, Ordering::SeqCst);
}

enum Outcome {
    Completed,
    Cancelled(CancelReason),
}

fn cancel_reason(reason: &Arc<Mutex<Option<CancelReason>>>) -> CancelReason {
    reason
        .lock()
        .expect("reason poisoned")
        .unwrap_or(CancelReason::User)
}

fn push_message(inner: &AgentInner, subject: &ReplaySubject, message: Message) {
    inner
        .messages
        .lock()
        .expect("messages poisoned")
        .push(message.clone());
    subject.publish(TaskEvent::Message { message });
}

/// Seed the user turn.  When a previously cancelled task left the history
/// ending in a user message, the new prompt's blocks merge into it so the
/// strict role alternation is preserved.
fn seed_prompt(inner: &AgentInner, subject: &ReplaySubject, prompt: TaskPrompt) {
    let mut blocks = vec![ContentBlock::text(prompt.text)];
    blocks.extend(prompt.images);
    let seeded = {
        let mut messages = inner.messages.lock().expect("messages poisoned");
        let ends_with_user = messages.last().map_or(false, |m| m.role == Role::User);
        if ends_with_user {
            let last = messages.last_mut().expect("non-empty");
            last.content.extend(blocks);
            last.clone()
        } else {
            messages.push(Message::user_with_blocks(blocks));
            messages.last().expect("just pushed").clone()
        }
    };
    subject.publish(TaskEvent::Message { message: seeded });
}

async fn task_loop(
    inner: &AgentInner,
    prompt: TaskPrompt,
    subject: &ReplaySubject,
    cancel: &CancellationToken,
    reason: &Arc<Mutex<Option<CancelReason>>>,
) -> Result<Outcome, TaskError> {
    seed_prompt(inner, subject, prompt);

    let mut turns = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled(cancel_reason(reason)));
        }
        turns += 1;
        if turns > inner.config.max_turns {
            return Err(TaskError::TurnLimit(inner.config.max_turns));
        }

        // One provider turn.
        let request = ChatRequest {
            system_prompt: inner.config.system_prompt.clone(),
            messages: inner.messages.lock().expect("messages poisoned").clone(),
            tools: inner.mcp.direct_tools().await,
            max_tokens: inner.config.max_tokens,
            cancel: cancel.child_token(),
        };
        let mut stream = inner
            .model
            .stream_chat(request)
            .await
            .map_err(|e| TaskError::Provider(e.to_string()))?;

        let mut seen_tool_use: HashSet<String> = HashSet::new();
        let mut completed: Option<(Message, kite_model::Usage)> = None;
        while let Some(event) = stream.next().await {
            match event {
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled(cancel_reason(reason)));
                    }
                    return Err(TaskError::Provider(e.to_string()));
                }
                Ok(ChatEvent::TextDelta { text }) => {
                    subject.publish(TaskEvent::Text { text });
                }
                Ok(ChatEvent::ToolUseStart { tool_use_id, name }) => {
                    if seen_tool_use.insert(tool_use_id.clone()) {
                        subject.publish(TaskEvent::ToolUse { tool_use_id, name });
                    }
                }
                Ok(ChatEvent::ToolUseInputDelta {
                    tool_use_id,
                    name,
                    partial_json,
                }) => {
                    subject.publish(TaskEvent::ToolUseInput {
                        tool_use_id,
                        name,
                        partial_json,
                    });
                }
                Ok(ChatEvent::Completed { message, usage }) => {
                    completed = Some((message, usage));
                    break;
                }
            }
        }
        let Some((assistant, usage)) = completed else {
            if cancel.is_cancelled() {
                return Ok(Outcome::Cancelled(cancel_reason(reason)));
            }
            return Err(TaskError::Provider(
                "provider stream ended without a final message".into(),
            ));
        };

        push_message(inner, subject, assistant.clone());
        subject.publish(TaskEvent::Usage { usage });

        let tool_uses: Vec<(String, String, serde_json::Value)> = assistant
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();
        if tool_uses.is_empty() {
            // Sanity over the invariant the loop maintains.
            validate_history(&inner.messages.lock().expect("messages poisoned"))?;
            return Ok(Outcome::Completed);
        }

        // Tool phase: document order, one result block per tool_use.
        let mut results: Vec<ContentBlock> = Vec::with_capacity(tool_uses.len());
        let mut cancelled = false;
        for (tool_use_id, name, input) in &tool_uses {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let outcome = inner
                .mcp
                .call_tool(
                    tool_use_id,
                    name,
                    input.clone(),
                    ToolCaller::Direct,
                    cancel.child_token(),
                )
                .await;
            let result = match outcome {
                Ok(result) => result,
                Err(ToolError::Aborted) => {
                    subject.publish(TaskEvent::ToolUseError {
                        tool_use_id: tool_use_id.clone(),
                        name: name.clone(),
                        message: "tool execution aborted".into(),
                    });
                    cancelled = true;
                    break;
                }
                // Conversational failures feed back to the model.
                Err(e) => kite_tools::ToolResult::error(e.to_string()),
            };
            if cancel.is_cancelled() {
                // A tool that ignored the signal finished anyway; its
                // result is discarded post-cancel.
                cancelled = true;
                break;
            }
            subject.publish(TaskEvent::ToolUseResult {
                tool_use_id: tool_use_id.clone(),
                name: name.clone(),
                result: result.clone(),
            });
            results.push(ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: result.content,
                is_error: result.is_error,
                structured_content: result.structured_content,
            });
        }

        if cancelled {
            // Pair every dangling tool_use with a cancelled result so the
            // history stays well-formed for the next task.
            for (tool_use_id, _, _) in tool_uses.iter().skip(results.len()) {
                results.push(ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: vec![ToolResultBlock::text("Tool execution cancelled.")],
                    is_error: true,
                    structured_content: None,
                });
            }
            push_message(inner, subject, Message::tool_results(results));
            return Ok(Outcome::Cancelled(cancel_reason(reason)));
        }

        push_message(inner, subject, Message::tool_results(results));
    }
}
