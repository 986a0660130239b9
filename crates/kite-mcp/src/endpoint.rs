// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How to reach an MCP server.
///
/// `Command` spawns a local process and speaks MCP over its stdio;
/// `Remote` speaks MCP over streamable HTTP, falling back to SSE when the
/// server does not support the streamable transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpServerEndpoint {
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl McpServerEndpoint {
    pub fn command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Command {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote {
            url: url.into(),
            headers: HashMap::new(),
        }
    }
}

/// Where a server registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSource {
    /// Resolved through a package registry.
    Registry,
    /// Registered with an explicit endpoint.
    Direct,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
