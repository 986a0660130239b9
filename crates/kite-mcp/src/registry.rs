// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use async_trait::async_trait;

use crate::{McpError, McpServerEndpoint};

/// Resolves a package identifier (e.g. a registry package name) to a
/// concrete server endpoint.
///
/// The wire protocol of the upstream registry is an embedder concern; the
/// core only defines the seam.  [`StaticRegistry`] covers tests and
/// embedders with a fixed catalog.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    async fn resolve(&self, package: &str) -> Result<McpServerEndpoint, McpError>;
}

/// A fixed name→endpoint catalog.
#[derive(Default)]
pub struct StaticRegistry {
    entries: HashMap<String, McpServerEndpoint>,
}

impl StaticRegistry {
    pub fn new(entries: HashMap<String, McpServerEndpoint>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, package: impl Into<String>, endpoint: McpServerEndpoint) {
        self.entries.insert(package.into(), endpoint);
    }
}

#[async_trait]
impl ServerRegistry for StaticRegistry {
    async fn resolve(&self, package: &str) -> Result<McpServerEndpoint, McpError> {
        self.entries
            .get(package)
            .cloned()
            .ok_or_else(|| McpError::Connection(format!("unknown registry package: {package}")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
