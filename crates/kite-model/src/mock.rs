// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    provider::{ChatEvent, ChatRequest, ChatStream, ModelProvider, Usage},
    ContentBlock, Message,
};

/// A pre-scripted provider.  Each call to `stream_chat` pops the next
/// script from the front of the queue.  This lets tests specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<ChatEvent>>>,
    /// The last `ChatRequest` seen by this provider.  Written on each
    /// `stream_chat` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of scripts.  The outer `Vec` is the
    /// ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<ChatEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Script for a plain text turn: one delta plus the terminal message.
    pub fn text_turn(text: impl Into<String>) -> Vec<ChatEvent> {
        let text = text.into();
        vec![
            ChatEvent::TextDelta { text: text.clone() },
            ChatEvent::Completed {
                message: Message::assistant(text),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            },
        ]
    }

    /// Script for a turn whose assistant message contains a single
    /// tool_use block.
    pub fn tool_use_turn(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Vec<ChatEvent> {
        let id = tool_use_id.into();
        let name = name.into();
        vec![
            ChatEvent::ToolUseStart {
                tool_use_id: id.clone(),
                name: name.clone(),
            },
            ChatEvent::ToolUseInputDelta {
                tool_use_id: id.clone(),
                name: name.clone(),
                partial_json: input.to_string(),
            },
            ChatEvent::Completed {
                message: Message::assistant_with_blocks(vec![ContentBlock::ToolUse {
                    tool_use_id: id,
                    name,
                    input,
                }]),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 8,
                },
            },
        ]
    }

    /// Script for a turn with several tool_use blocks in document order.
    pub fn multi_tool_use_turn(calls: Vec<(String, String, Value)>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        let mut blocks = Vec::new();
        for (id, name, input) in calls {
            events.push(ChatEvent::ToolUseStart {
                tool_use_id: id.clone(),
                name: name.clone(),
            });
            blocks.push(ContentBlock::ToolUse {
                tool_use_id: id,
                name,
                input,
            });
        }
        events.push(ChatEvent::Completed {
            message: Message::assistant_with_blocks(blocks),
            usage: Usage::default(),
        });
        events
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<ChatStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                Self::text_turn("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ChatEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// A provider whose stream never produces an event until the request's
/// cancellation token fires, at which point it errors.  Used to exercise
/// cancellation during the provider phase.
#[derive(Default)]
pub struct PendingProvider;

#[async_trait]
impl ModelProvider for PendingProvider {
    fn name(&self) -> &str {
        "pending-mock"
    }

    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<ChatStream> {
        let cancel = req.cancel.clone();
        let s = stream::once(async move {
            cancel.cancelled().await;
            Err::<ChatEvent, anyhow::Error>(anyhow::anyhow!("stream aborted"))
        });
        Ok(Box::pin(s))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
