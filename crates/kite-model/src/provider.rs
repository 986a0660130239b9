// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Message;

pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<ChatEvent>> + Send>>;

/// A tool made visible to the model for this request.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: Value,
}

/// One streaming request to a model provider.
///
/// The core assumes at most one provider call in flight per agent; the
/// provider may rely on that and keep per-call state.
#[derive(Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u32,
    /// Cancelling this token must terminate the upstream stream promptly
    /// and cause the event stream to error.
    pub cancel: CancellationToken,
}

/// A single streamed event from the model.
///
/// `Completed` is terminal: it carries the fully assembled assistant
/// message (text and tool_use blocks in document order) plus token usage.
/// Providers must emit it exactly once, after all deltas.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A text chunk streamed from the model.
    TextDelta { text: String },
    /// The model opened a tool_use block.
    ToolUseStart { tool_use_id: String, name: String },
    /// Incremental JSON for a tool_use block's input.
    ToolUseInputDelta {
        tool_use_id: String,
        name: String,
        partial_json: String,
    },
    /// The stream finished; the assembled assistant message.
    Completed { message: Message, usage: Usage },
}

/// Token usage from one provider turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The contract between the agent loop and a concrete LLM driver.
///
/// Concrete wire formats (Anthropic, OpenAI, gateways) live outside the
/// core; the loop only consumes this trait.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display and logs.
    fn name(&self) -> &str;

    /// Send a streaming chat request.
    ///
    /// The returned stream yields deltas followed by a terminal
    /// [`ChatEvent::Completed`].  After cancellation via
    /// [`ChatRequest::cancel`] the stream must yield an error item.
    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<ChatStream>;
}
