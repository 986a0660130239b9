// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod bridge;
mod client;
mod endpoint;
mod error;
mod manager;
mod oauth;
mod registry;
mod transport;

pub use client::{
    ClientState, ClientStatus, ConnectedPhase, ConnectingPhase, DesiredState,
    DiscoveredTool, McpClient, McpClientConfig,
};
pub use endpoint::{McpServerEndpoint, ServerSource};
pub use error::McpError;
pub use manager::{ManagerEvent, McpServerManager, ServerRecord};
pub use oauth::{AuthorizationServerMetadata, OAuthCallbackHandler, PkceChallenge};
pub use registry::{ServerRegistry, StaticRegistry};
pub use transport::{Connector, McpTransport, RawToolInfo, RmcpConnector};
