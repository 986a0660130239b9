// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Registry of MCP clients plus locally-registered tools, aggregated into
//! one addressable pool.
//!
//! Tool-name uniqueness holds across all sources: a collision — local vs
//! local, local vs MCP, or between two servers' prefixed names — is a hard
//! error at registration time.  The aggregated `tools` view always
//! reflects the union of local tools and the tools of clients currently in
//! `connected.tool_discovered`; clients in any other state contribute
//! nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kite_model::ToolDescriptor;
use kite_tools::{
    validate_tool_name, CompiledSchema, ExecuteOptions, Tool, ToolCaller, ToolContext,
    ToolError, ToolResult,
};

use crate::{
    client::{ClientState, ConnectedPhase, McpClient, McpClientConfig},
    transport::Connector,
    McpError, McpServerEndpoint, OAuthCallbackHandler, ServerRegistry, ServerSource,
};

/// How long `register_server` waits for the first terminal client state.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// One registered server.
#[derive(Clone)]
pub struct ServerRecord {
    pub id: String,
    pub endpoint: McpServerEndpoint,
    pub source: ServerSource,
    pub client: McpClient,
}

/// Lifecycle events observable through [`McpServerManager::events`].
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    ServerAdded { id: String },
    /// A server's tool set changed after its initial discovery.
    ServerUpdated { id: String },
    ServerRemoved { id: String },
    ClientStatusChanged {
        id: String,
        status: crate::ClientStatus,
    },
}

struct LocalTool {
    tool: Arc<dyn Tool>,
    schema: CompiledSchema,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<String, ServerRecord>,
    local_tools: HashMap<String, LocalTool>,
    /// Compiled input schemas for MCP tools, keyed by prefixed name.
    /// Compiled on first use and cached until the server is deregistered.
    mcp_schemas: HashMap<String, Arc<CompiledSchema>>,
}

pub struct McpServerManager {
    connector: Arc<dyn Connector>,
    registry: Option<Arc<dyn ServerRegistry>>,
    oauth: Option<Arc<dyn OAuthCallbackHandler>>,
    inner: RwLock<Inner>,
    events_tx: broadcast::Sender<ManagerEvent>,
}

impl McpServerManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            connector,
            registry: None,
            oauth: None,
            inner: RwLock::new(Inner::default()),
            events_tx,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ServerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_oauth(mut self, oauth: Arc<dyn OAuthCallbackHandler>) -> Self {
        self.oauth = Some(oauth);
        self
    }

    pub fn events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    /// Register a server with an explicit endpoint.  Creates and starts
    /// the client eagerly, then awaits the first terminal state.  On a
    /// connection error the record stays in place so the caller may
    /// `retry` through it; on a tool-name collision the server is removed
    /// again and the registration is rejected.
    pub async fn register_server(
        &self,
        id: impl Into<String>,
        endpoint: McpServerEndpoint,
    ) -> Result<(), McpError> {
        self.register_server_with_source(id.into(), endpoint, ServerSource::Direct)
            .await
    }

    /// Resolve a package identifier through the configured registry, then
    /// register the resulting endpoint.
    pub async fn register_server_from_registry(
        &self,
        id: impl Into<String>,
        package: &str,
    ) -> Result<(), McpError> {
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| McpError::Connection("no server registry configured".into()))?;
        let endpoint = registry.resolve(package).await?;
        self.register_server_with_source(id.into(), endpoint, ServerSource::Registry)
            .await
    }

    async fn register_server_with_source(
        &self,
        id: String,
        endpoint: McpServerEndpoint,
        source: ServerSource,
    ) -> Result<(), McpError> {
        {
            let inner = self.inner.read().await;
            if inner.servers.contains_key(&id) {
                return Err(McpError::DuplicateServer { id });
            }
        }

        let client = McpClient::spawn(McpClientConfig {
            id: id.clone(),
            endpoint: endpoint.clone(),
            connector: Arc::clone(&self.connector),
            oauth: self.oauth.clone(),
            enabled: true,
        });
        let record = ServerRecord {
            id: id.clone(),
            endpoint,
            source,
            client: client.clone(),
        };

        {
            let mut inner = self.inner.write().await;
            inner.servers.insert(id.clone(), record);
        }
        let _ = self.events_tx.send(ManagerEvent::ServerAdded { id: id.clone() });
        self.spawn_status_forwarder(id.clone(), client.clone());

        // Await the first terminal state: tool discovery or error.
        if let Err(e) = client.wait_for_connection(REGISTER_TIMEOUT).await {
            warn!(server_id = %id, error = %e, "server registration failed; record kept for retry");
            return Err(e);
        }

        // Uniqueness gate over the whole pool.
        let discovered = client.tools();
        let collision = {
            let inner = self.inner.read().await;
            discovered.iter().find_map(|t| {
                let taken_locally = inner.local_tools.contains_key(&t.name);
                let taken_remotely = inner
                    .servers
                    .values()
                    .filter(|r| r.id != id)
                    .any(|r| r.client.tools().iter().any(|other| other.name == t.name));
                (taken_locally || taken_remotely).then(|| t.name.clone())
            })
        };
        if let Some(name) = collision {
            warn!(server_id = %id, tool = %name, "tool name collision; rejecting registration");
            self.deregister_server(&id).await;
            return Err(McpError::DuplicateTool { name });
        }

        info!(server_id = %id, tool_count = discovered.len(), "server registered");
        Ok(())
    }

    /// Dispose the client and drop the record.  A no-op for unknown ids.
    pub async fn deregister_server(&self, id: &str) {
        let record = {
            let mut inner = self.inner.write().await;
            let record = inner.servers.remove(id);
            let prefix = format!("{id}_");
            inner.mcp_schemas.retain(|name, _| !name.starts_with(&prefix));
            record
        };
        if let Some(record) = record {
            record.client.dispose().await;
            let _ = self.events_tx.send(ManagerEvent::ServerRemoved {
                id: id.to_string(),
            });
        }
    }

    /// Snapshot of the registered servers.
    pub async fn servers(&self) -> Vec<ServerRecord> {
        self.inner.read().await.servers.values().cloned().collect()
    }

    /// Register a locally-defined tool.  The input schema is compiled
    /// here, once; name collisions with anything already in the pool are
    /// rejected.
    pub async fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), McpError> {
        let name = tool.name().to_string();
        validate_tool_name(&name)
            .map_err(|e| McpError::InvalidRegistration(e.to_string()))?;
        let schema = CompiledSchema::compile(tool.input_schema())
            .map_err(|e| McpError::InvalidRegistration(e.to_string()))?;

        let mut inner = self.inner.write().await;
        if inner.local_tools.contains_key(&name) {
            return Err(McpError::DuplicateTool { name });
        }
        let taken_by_server = inner
            .servers
            .values()
            .any(|r| r.client.tools().iter().any(|t| t.name == name));
        if taken_by_server {
            return Err(McpError::DuplicateTool { name });
        }
        debug!(tool = %name, "local tool registered");
        inner.local_tools.insert(name, LocalTool { tool, schema });
        Ok(())
    }

    /// The aggregated tool pool: local tools plus the tools of every
    /// client currently in `connected.tool_discovered`, sorted by name.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read().await;
        let mut out: Vec<ToolDescriptor> = inner
            .local_tools
            .values()
            .map(|lt| ToolDescriptor {
                name: lt.tool.name().to_string(),
                description: lt.tool.description().to_string(),
                input_schema: lt.schema.raw().clone(),
            })
            .collect();
        for record in inner.servers.values() {
            for t in record.client.tools() {
                out.push(ToolDescriptor {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Tools callable from the model's own turn.
    pub async fn direct_tools(&self) -> Vec<ToolDescriptor> {
        self.tools_for_caller(ToolCaller::Direct).await
    }

    /// Tools callable only from inside a code-execution sandbox.
    pub async fn programmatic_tools(&self) -> Vec<ToolDescriptor> {
        self.tools_for_caller(ToolCaller::Programmatic).await
    }

    async fn tools_for_caller(&self, caller: ToolCaller) -> Vec<ToolDescriptor> {
        let inner = self.inner.read().await;
        let mut out: Vec<ToolDescriptor> = inner
            .local_tools
            .values()
            .filter(|lt| lt.tool.allowed_callers().contains(&caller))
            .map(|lt| ToolDescriptor {
                name: lt.tool.name().to_string(),
                description: lt.tool.description().to_string(),
                input_schema: lt.schema.raw().clone(),
            })
            .collect();
        // MCP tools carry no caller metadata; they are direct-callable.
        if caller == ToolCaller::Direct {
            for record in inner.servers.values() {
                for t in record.client.tools() {
                    out.push(ToolDescriptor {
                        name: t.name,
                        description: t.description,
                        input_schema: t.input_schema,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Validate and execute one tool call.
    ///
    /// Schema failures and execution failures come back as `Err` values
    /// the agent loop converts into `is_error` tool results; an
    /// [`ToolError::Aborted`] means the cancellation signal fired.
    pub async fn call_tool(
        &self,
        tool_use_id: &str,
        name: &str,
        input: Value,
        caller: ToolCaller,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        // Local tools first: gate, validate, then execute outside the lock.
        let local = {
            let inner = self.inner.read().await;
            match inner.local_tools.get(name) {
                None => None,
                Some(lt) => {
                    if !lt.tool.allowed_callers().contains(&caller) {
                        return Err(ToolError::Execution {
                            message: format!("tool {name} is not callable by {caller:?} callers"),
                        });
                    }
                    lt.schema.validate(&input)?;
                    Some(Arc::clone(&lt.tool))
                }
            }
        };
        if let Some(tool) = local {
            let ctx = ToolContext {
                tool_use_id: tool_use_id.to_string(),
                caller,
            };
            return tool.execute(input, &ctx, ExecuteOptions { cancel }).await;
        }

        // MCP tools, by prefixed name.
        let found = {
            let inner = self.inner.read().await;
            inner.servers.values().find_map(|record| {
                record
                    .client
                    .tools()
                    .into_iter()
                    .find(|t| t.name == name)
                    .map(|t| (record.client.clone(), t))
            })
        };
        let Some((client, tool)) = found else {
            return Err(ToolError::Execution {
                message: format!("unknown tool: {name}"),
            });
        };
        if caller != ToolCaller::Direct {
            return Err(ToolError::Execution {
                message: format!("tool {name} is not callable by {caller:?} callers"),
            });
        }

        let schema = self.mcp_schema(&tool.name, &tool.input_schema).await?;
        schema.validate(&input)?;

        match client
            .execute_tool_call(&tool.remote_name, input, cancel)
            .await
        {
            Ok(result) => Ok(result),
            Err(McpError::Cancelled) => Err(ToolError::Aborted),
            Err(e) => Err(ToolError::Execution {
                message: e.to_string(),
            }),
        }
    }

    async fn mcp_schema(
        &self,
        prefixed_name: &str,
        raw: &Value,
    ) -> Result<Arc<CompiledSchema>, ToolError> {
        {
            let inner = self.inner.read().await;
            if let Some(schema) = inner.mcp_schemas.get(prefixed_name) {
                return Ok(Arc::clone(schema));
            }
        }
        let compiled = Arc::new(CompiledSchema::compile(raw.clone())?);
        self.inner
            .write()
            .await
            .mcp_schemas
            .insert(prefixed_name.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Dispose every client.  Used on agent shutdown.
    pub async fn dispose_all(&self) {
        let records: Vec<ServerRecord> = {
            let mut inner = self.inner.write().await;
            inner.mcp_schemas.clear();
            inner.servers.drain().map(|(_, r)| r).collect()
        };
        for record in records {
            record.client.dispose().await;
            let _ = self
                .events_tx
                .send(ManagerEvent::ServerRemoved { id: record.id });
        }
    }

    fn spawn_status_forwarder(&self, id: String, client: McpClient) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut stream = client.status_stream();
            let mut discovered_before = false;
            while let Some(status) = stream.next().await {
                let discovered =
                    status.state == ClientState::Connected(ConnectedPhase::ToolsDiscovered);
                if discovered && discovered_before {
                    let _ = events_tx.send(ManagerEvent::ServerUpdated { id: id.clone() });
                }
                discovered_before = discovered_before || discovered;
                let done = status.state == ClientState::Disposed;
                let _ = events_tx.send(ManagerEvent::ClientStatusChanged {
                    id: id.clone(),
                    status,
                });
                if done {
                    break;
                }
            }
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::{
        oauth::AuthorizationServerMetadata, oauth::PkceChallenge,
        transport::{McpTransport, RawToolInfo},
        StaticRegistry,
    };

    use super::*;

    // ── Test doubles ─────────────────────────────────────────────────────────

    struct PoolTransport {
        tools: Vec<RawToolInfo>,
    }

    #[async_trait]
    impl McpTransport for PoolTransport {
        async fn list_tools(&self) -> Result<Vec<RawToolInfo>, McpError> {
            Ok(self.tools.clone())
        }
        async fn call_tool(&self, name: &str, input: Value) -> Result<Value, McpError> {
            Ok(json!({
                "content": [{"type": "text", "text": format!("{name} ran with {input}")}]
            }))
        }
        async fn close(self: Box<Self>) -> Result<(), McpError> {
            Ok(())
        }
    }

    /// Connector serving a fixed tool list per server id.
    #[derive(Default)]
    struct PoolConnector {
        tools_by_server: HashMap<String, Vec<RawToolInfo>>,
        failures_remaining: AtomicUsize,
    }

    impl PoolConnector {
        fn with_server(mut self, id: &str, tool_names: &[&str]) -> Self {
            self.tools_by_server.insert(
                id.to_string(),
                tool_names
                    .iter()
                    .map(|n| RawToolInfo {
                        name: n.to_string(),
                        description: format!("{n} tool"),
                        input_schema: json!({"type": "object"}),
                    })
                    .collect(),
            );
            self
        }
    }

    #[async_trait]
    impl Connector for PoolConnector {
        async fn preflight(
            &self,
            _endpoint: &McpServerEndpoint,
        ) -> Result<Option<AuthorizationServerMetadata>, McpError> {
            Ok(None)
        }
        async fn exchange_code(
            &self,
            _metadata: &AuthorizationServerMetadata,
            _pkce: &PkceChallenge,
            _code: &str,
            _redirect_uri: &str,
        ) -> Result<String, McpError> {
            Err(McpError::OAuth("not supported".into()))
        }
        async fn connect(
            &self,
            id: &str,
            _endpoint: &McpServerEndpoint,
            _bearer: Option<&str>,
        ) -> Result<Box<dyn McpTransport>, McpError> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(McpError::Connection("simulated failure".into()));
            }
            let tools = self
                .tools_by_server
                .get(id)
                .cloned()
                .unwrap_or_default();
            Ok(Box::new(PoolTransport { tools }))
        }
    }

    struct EchoTool {
        executed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            input: Value,
            _ctx: &ToolContext,
            _opts: ExecuteOptions,
        ) -> Result<ToolResult, ToolError> {
            self.executed.store(true, Ordering::SeqCst);
            Ok(ToolResult::text(
                input["text"].as_str().unwrap_or_default().to_string(),
            ))
        }
    }

    struct ProgrammaticOnlyTool;

    #[async_trait]
    impl Tool for ProgrammaticOnlyTool {
        fn name(&self) -> &str {
            "inner"
        }
        fn description(&self) -> &str {
            "sandbox-only tool"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn allowed_callers(&self) -> &[ToolCaller] {
            &[ToolCaller::Programmatic]
        }
        async fn execute(
            &self,
            _input: Value,
            _ctx: &ToolContext,
            _opts: ExecuteOptions,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text("inner ok"))
        }
    }

    fn manager(connector: PoolConnector) -> McpServerManager {
        McpServerManager::new(Arc::new(connector))
    }

    fn endpoint() -> McpServerEndpoint {
        McpServerEndpoint::command("server-bin", vec![])
    }

    // ── Server registration ──────────────────────────────────────────────────

    #[tokio::test]
    async fn register_server_exposes_prefixed_tools() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        let names: Vec<String> = m.tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["docs_search"]);
    }

    #[tokio::test]
    async fn duplicate_server_id_rejected() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        let err = m.register_server("docs", endpoint()).await;
        assert!(matches!(err, Err(McpError::DuplicateServer { .. })));
    }

    #[tokio::test]
    async fn failed_registration_keeps_record_for_retry() {
        let connector = PoolConnector::default().with_server("docs", &["search"]);
        connector.failures_remaining.store(1, Ordering::SeqCst);
        let m = manager(connector);

        let err = m.register_server("docs", endpoint()).await;
        assert!(err.is_err());
        let servers = m.servers().await;
        assert_eq!(servers.len(), 1, "record must survive a connect failure");

        // Retry through the kept record.
        servers[0].client.retry().await;
        servers[0]
            .client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(m.tools().await.len(), 1);
    }

    #[tokio::test]
    async fn deregister_removes_tools() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        m.deregister_server("docs").await;
        assert!(m.tools().await.is_empty());
        assert!(m.servers().await.is_empty());
    }

    #[tokio::test]
    async fn register_from_registry_resolves_endpoint() {
        let mut registry = StaticRegistry::default();
        registry.insert("com.example/docs", endpoint());
        let m = manager(PoolConnector::default().with_server("docs", &["search"]))
            .with_registry(Arc::new(registry));
        m.register_server_from_registry("docs", "com.example/docs")
            .await
            .unwrap();
        let servers = m.servers().await;
        assert_eq!(servers[0].source, ServerSource::Registry);
    }

    #[tokio::test]
    async fn registry_unconfigured_is_an_error() {
        let m = manager(PoolConnector::default());
        let err = m.register_server_from_registry("x", "pkg").await;
        assert!(err.is_err());
    }

    // ── Tool aggregation and uniqueness ──────────────────────────────────────

    #[tokio::test]
    async fn local_tool_collision_rejected() {
        let m = manager(PoolConnector::default());
        m.register_tool(Arc::new(EchoTool {
            executed: Arc::new(AtomicBool::new(false)),
        }))
        .await
        .unwrap();
        let err = m
            .register_tool(Arc::new(EchoTool {
                executed: Arc::new(AtomicBool::new(false)),
            }))
            .await;
        assert!(matches!(err, Err(McpError::DuplicateTool { name }) if name == "echo"));
    }

    #[tokio::test]
    async fn mcp_collision_with_local_tool_rejected() {
        struct Collider;
        #[async_trait]
        impl Tool for Collider {
            fn name(&self) -> &str {
                "docs_search"
            }
            fn description(&self) -> &str {
                "collides with a prefixed mcp name"
            }
            fn input_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(
                &self,
                _input: Value,
                _ctx: &ToolContext,
                _opts: ExecuteOptions,
            ) -> Result<ToolResult, ToolError> {
                Ok(ToolResult::text("local"))
            }
        }

        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_tool(Arc::new(Collider)).await.unwrap();
        let err = m.register_server("docs", endpoint()).await;
        assert!(matches!(err, Err(McpError::DuplicateTool { name }) if name == "docs_search"));
        assert!(
            m.servers().await.is_empty(),
            "colliding server must be removed again"
        );
    }

    #[tokio::test]
    async fn tools_only_from_discovered_clients() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        assert_eq!(m.tools().await.len(), 1);

        let servers = m.servers().await;
        servers[0].client.set_desired_enabled(false).await;
        // Wait for the disconnect to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(m.tools().await.is_empty());
    }

    #[tokio::test]
    async fn direct_and_programmatic_views_filter_by_caller() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        m.register_tool(Arc::new(ProgrammaticOnlyTool)).await.unwrap();

        let direct: Vec<String> = m.direct_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(direct, ["docs_search"]);

        let programmatic: Vec<String> = m
            .programmatic_tools()
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(programmatic, ["inner"]);
    }

    // ── Tool calls ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn call_local_tool() {
        let m = manager(PoolConnector::default());
        m.register_tool(Arc::new(EchoTool {
            executed: Arc::new(AtomicBool::new(false)),
        }))
        .await
        .unwrap();
        let result = m
            .call_tool(
                "tu-1",
                "echo",
                json!({"text": "hi"}),
                ToolCaller::Direct,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.text_content(), "hi");
    }

    #[tokio::test]
    async fn schema_failure_skips_execute() {
        let executed = Arc::new(AtomicBool::new(false));
        let m = manager(PoolConnector::default());
        m.register_tool(Arc::new(EchoTool {
            executed: Arc::clone(&executed),
        }))
        .await
        .unwrap();
        let err = m
            .call_tool(
                "tu-1",
                "echo",
                json!({"text": 123}),
                ToolCaller::Direct,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(ToolError::InvalidInput { .. })));
        assert!(!executed.load(Ordering::SeqCst), "execute must not run");
    }

    #[tokio::test]
    async fn call_mcp_tool_by_prefixed_name() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        let result = m
            .call_tool(
                "tu-2",
                "docs_search",
                json!({"q": "kite"}),
                ToolCaller::Direct,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.text_content().contains("search ran with"));
    }

    #[tokio::test]
    async fn unknown_tool_is_execution_error() {
        let m = manager(PoolConnector::default());
        let err = m
            .call_tool(
                "tu-3",
                "missing",
                json!({}),
                ToolCaller::Direct,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(ToolError::Execution { .. })));
    }

    #[tokio::test]
    async fn caller_gate_enforced() {
        let m = manager(PoolConnector::default());
        m.register_tool(Arc::new(ProgrammaticOnlyTool)).await.unwrap();
        let err = m
            .call_tool(
                "tu-4",
                "inner",
                json!({}),
                ToolCaller::Direct,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(ToolError::Execution { .. })));

        let ok = m
            .call_tool(
                "tu-5",
                "inner",
                json!({}),
                ToolCaller::Programmatic,
                CancellationToken::new(),
            )
            .await;
        assert!(ok.is_ok());
    }

    // ── Events ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn registration_emits_added_and_status_events() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        let mut events = m.events();
        m.register_server("docs", endpoint()).await.unwrap();
        // The status forwarder runs on its own task; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut saw_added = false;
        let mut saw_status = false;
        while let Ok(ev) = events.try_recv() {
            match ev {
                ManagerEvent::ServerAdded { id } if id == "docs" => saw_added = true,
                ManagerEvent::ClientStatusChanged { id, .. } if id == "docs" => saw_status = true,
                _ => {}
            }
        }
        assert!(saw_added);
        assert!(saw_status);
    }

    #[tokio::test]
    async fn deregistration_emits_removed() {
        let m = manager(PoolConnector::default().with_server("docs", &["search"]));
        m.register_server("docs", endpoint()).await.unwrap();
        let mut events = m.events();
        m.deregister_server("docs").await;
        let mut saw_removed = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, ManagerEvent::ServerRemoved { ref id } if id == "docs") {
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }
}
