// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod message;
mod mock;
mod provider;

pub use message::{
    validate_history, ContentBlock, HistoryError, Message, Role, ToolResultBlock,
};
pub use mock::{PendingProvider, ScriptedProvider};
pub use provider::{
    ChatEvent, ChatRequest, ChatStream, ModelProvider, ToolDescriptor, Usage,
};
