// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Transport seam between the client state machine and the MCP SDK.
//!
//! The state machine only sees [`Connector`] (preflight + connect +
//! code exchange) and [`McpTransport`] (`list_tools` / `call_tool` /
//! `close`), so tests drive it with mocks and the rmcp dependency stays
//! contained in this module.  The core never serializes JSON-RPC itself.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParams, ClientCapabilities, ClientInfo, Implementation},
    service::RunningService,
    transport::{
        sse_client::{SseClientConfig, SseClientTransport},
        streamable_http_client::{
            StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
        },
        ConfigureCommandExt, TokioChildProcess,
    },
    ClientHandler, RoleClient, ServiceExt,
};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use crate::{
    oauth::{AuthorizationServerMetadata, PkceChallenge, TokenResponse, CLIENT_ID},
    McpError, McpServerEndpoint,
};

/// A tool as reported by a server's `tools/list`, before conversion to
/// the kite tool contract.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object, passed through unmodified.
    pub input_schema: Value,
}

/// An established MCP session.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RawToolInfo>, McpError>;

    /// Call a tool by its server-side (unprefixed) name.  Returns the raw
    /// result value; shape normalization happens in [`crate::bridge`].
    async fn call_tool(&self, name: &str, input: Value) -> Result<Value, McpError>;

    async fn close(self: Box<Self>) -> Result<(), McpError>;
}

/// Creates transports and performs the OAuth preflight / code exchange.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Probe a remote endpoint before connecting.  `Ok(None)` means no
    /// authorization is required; `Ok(Some(metadata))` means the handshake
    /// returned 401 and the server advertises OAuth metadata.
    async fn preflight(
        &self,
        endpoint: &McpServerEndpoint,
    ) -> Result<Option<AuthorizationServerMetadata>, McpError>;

    /// Exchange an authorization code for an access token.
    async fn exchange_code(
        &self,
        metadata: &AuthorizationServerMetadata,
        pkce: &PkceChallenge,
        code: &str,
        redirect_uri: &str,
    ) -> Result<String, McpError>;

    /// Open a session on the endpoint.  `bearer` carries the OAuth access
    /// token when one was obtained.
    async fn connect(
        &self,
        id: &str,
        endpoint: &McpServerEndpoint,
        bearer: Option<&str>,
    ) -> Result<Box<dyn McpTransport>, McpError>;
}

// ─── rmcp-backed implementation ──────────────────────────────────────────────

#[derive(Clone)]
struct KiteClientHandler {
    info: ClientInfo,
}

impl KiteClientHandler {
    fn new(server_id: &str) -> Self {
        Self {
            info: ClientInfo {
                protocol_version: Default::default(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: format!("kite-{server_id}"),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    title: None,
                    description: None,
                    icons: None,
                    website_url: None,
                },
                meta: None,
            },
        }
    }
}

impl ClientHandler for KiteClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

type ClientService = RunningService<RoleClient, KiteClientHandler>;

struct RmcpTransport {
    server_id: String,
    service: ClientService,
}

#[async_trait]
impl McpTransport for RmcpTransport {
    async fn list_tools(&self) -> Result<Vec<RawToolInfo>, McpError> {
        let result = self
            .service
            .peer()
            .list_tools(Default::default())
            .await
            .map_err(|e| McpError::Connection(format!("tools/list failed: {e}")))?;
        let tools = result
            .tools
            .into_iter()
            .map(|t| RawToolInfo {
                name: t.name.to_string(),
                description: t.description.as_deref().unwrap_or_default().to_string(),
                input_schema: Value::Object(t.input_schema.as_ref().clone()),
            })
            .collect();
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, input: Value) -> Result<Value, McpError> {
        debug!(server_id = %self.server_id, tool = %name, "calling mcp tool");
        let arguments = match input {
            Value::Object(m) => Some(m),
            Value::Null => None,
            other => {
                return Err(McpError::Protocol(format!(
                    "tool input must be a JSON object, got {other}"
                )))
            }
        };
        let result = self
            .service
            .peer()
            .call_tool(CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
                task: None,
                meta: None,
            })
            .await
            .map_err(|e| McpError::Connection(format!("tools/call failed: {e}")))?;
        serde_json::to_value(result)
            .map_err(|e| McpError::Protocol(format!("unserializable tool result: {e}")))
    }

    async fn close(self: Box<Self>) -> Result<(), McpError> {
        self.service
            .cancel()
            .await
            .map_err(|e| McpError::Connection(format!("close failed: {e}")))?;
        Ok(())
    }
}

/// Production [`Connector`] backed by rmcp transports and reqwest.
pub struct RmcpConnector {
    http: reqwest::Client,
}

impl RmcpConnector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn http_client_with_headers(
        headers: &HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<reqwest::Client, McpError> {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name: reqwest::header::HeaderName = k
                .parse()
                .map_err(|_| McpError::Connection(format!("invalid header name: {k}")))?;
            let value = v
                .parse()
                .map_err(|_| McpError::Connection(format!("invalid header value for {k}")))?;
            map.insert(name, value);
        }
        if let Some(token) = bearer {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| McpError::OAuth("access token is not a valid header".into()))?;
            map.insert(reqwest::header::AUTHORIZATION, value);
        }
        reqwest::Client::builder()
            .default_headers(map)
            .build()
            .map_err(|e| McpError::Connection(format!("http client build failed: {e}")))
    }

    async fn connect_remote(
        &self,
        id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<Box<dyn McpTransport>, McpError> {
        let handler = KiteClientHandler::new(id);
        let client = Self::http_client_with_headers(headers, bearer)?;

        // First attempt: streamable HTTP.
        let transport = StreamableHttpClientTransport::with_client(
            client.clone(),
            StreamableHttpClientTransportConfig::with_uri(url.to_string()),
        );
        match handler.clone().serve(transport).await {
            Ok(service) => {
                info!(server_id = %id, %url, "connected via streamable http");
                return Ok(Box::new(RmcpTransport {
                    server_id: id.to_string(),
                    service,
                }));
            }
            Err(e) => {
                let msg = e.to_string();
                if !should_fall_back_to_sse(&msg) {
                    return Err(McpError::Connection(format!(
                        "streamable http handshake failed: {msg}"
                    )));
                }
                debug!(server_id = %id, error = %msg, "falling back to sse transport");
            }
        }

        // Fallback: SSE.
        let transport = SseClientTransport::start_with_client(
            client,
            SseClientConfig {
                sse_endpoint: url.to_string().into(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| McpError::Connection(format!("sse transport failed: {e}")))?;
        let service = handler
            .serve(transport)
            .await
            .map_err(|e| McpError::Connection(format!("sse handshake failed: {e}")))?;
        info!(server_id = %id, %url, "connected via sse fallback");
        Ok(Box::new(RmcpTransport {
            server_id: id.to_string(),
            service,
        }))
    }

    async fn connect_command(
        &self,
        id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Box<dyn McpTransport>, McpError> {
        let args = args.to_vec();
        let env = env.clone();
        let transport = TokioChildProcess::new(Command::new(command).configure(move |cmd| {
            cmd.args(&args)
                .envs(&env)
                .stderr(Stdio::null())
                .kill_on_drop(true);
            // New process group so terminal signals sent to the host do
            // not propagate to MCP server children.
            #[cfg(unix)]
            {
                cmd.process_group(0);
            }
        }))
        .map_err(|e| {
            McpError::Connection(format!("failed to spawn {command}: {e}"))
        })?;

        let service = KiteClientHandler::new(id)
            .serve(transport)
            .await
            .map_err(|e| McpError::Connection(format!("stdio handshake failed: {e}")))?;
        info!(server_id = %id, %command, "connected via stdio");
        Ok(Box::new(RmcpTransport {
            server_id: id.to_string(),
            service,
        }))
    }
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn preflight(
        &self,
        endpoint: &McpServerEndpoint,
    ) -> Result<Option<AuthorizationServerMetadata>, McpError> {
        let McpServerEndpoint::Remote { url, headers } = endpoint else {
            return Ok(None);
        };
        let mut req = self
            .http
            .post(url)
            .header("accept", "application/json, text/event-stream")
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "ping"
            }));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| McpError::Connection(format!("preflight failed: {e}")))?;
        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        // 401: look for authorization-server metadata at the origin.
        let parsed =
            Url::parse(url).map_err(|e| McpError::Connection(format!("bad url {url}: {e}")))?;
        let origin = parsed.origin().ascii_serialization();
        let metadata_url = format!("{origin}/.well-known/oauth-authorization-server");
        let resp = self
            .http
            .get(&metadata_url)
            .send()
            .await
            .map_err(|e| McpError::OAuth(format!("metadata fetch failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::Connection(format!(
                "server returned 401 and no oauth metadata at {metadata_url}"
            )));
        }
        let metadata: AuthorizationServerMetadata = resp
            .json()
            .await
            .map_err(|e| McpError::OAuth(format!("invalid oauth metadata: {e}")))?;
        Ok(Some(metadata))
    }

    async fn exchange_code(
        &self,
        metadata: &AuthorizationServerMetadata,
        pkce: &PkceChallenge,
        code: &str,
        redirect_uri: &str,
    ) -> Result<String, McpError> {
        let resp = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", CLIENT_ID),
                ("code_verifier", &pkce.verifier),
            ])
            .send()
            .await
            .map_err(|e| McpError::OAuth(format!("token request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::OAuth(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| McpError::OAuth(format!("invalid token response: {e}")))?;
        Ok(token.access_token)
    }

    async fn connect(
        &self,
        id: &str,
        endpoint: &McpServerEndpoint,
        bearer: Option<&str>,
    ) -> Result<Box<dyn McpTransport>, McpError> {
        match endpoint {
            McpServerEndpoint::Command { command, args, env } => {
                self.connect_command(id, command, args, env).await
            }
            McpServerEndpoint::Remote { url, headers } => {
                self.connect_remote(id, url, headers, bearer).await
            }
        }
    }
}

/// Decide whether a streamable-HTTP handshake failure should trigger the
/// SSE fallback.  The signatures are a non-2xx status on the handshake
/// request (typically 404/405 from servers that predate the streamable
/// transport) or an incompatible response content type.
fn should_fall_back_to_sse(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    lower.contains("404")
        || lower.contains("405")
        || lower.contains("not found")
        || lower.contains("method not allowed")
        || lower.contains("content-type")
        || lower.contains("content type")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
