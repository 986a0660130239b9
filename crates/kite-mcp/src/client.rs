// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-server MCP client: a desired-state-reconciling state machine.
//!
//! The machine runs as a single-writer actor task.  External callers hold
//! a cheap [`McpClient`] handle that sends commands over an mpsc channel
//! and observes [`ClientStatus`] snapshots through a watch channel.  Every
//! state mutation happens inside the actor, so no locking is needed and
//! transitions are published in order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kite_tools::ToolResult;

use crate::{
    bridge,
    oauth::{build_authorize_url, OAuthCallbackHandler, PkceChallenge},
    transport::{Connector, McpTransport},
    McpError, McpServerEndpoint,
};

/// Substate while a connect attempt is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectingPhase {
    Initial,
    /// The handshake returned 401 with OAuth metadata; the attempt is
    /// suspended until the injected callback handler yields a code.
    AwaitingOauth,
}

/// Substate while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedPhase {
    Initial,
    /// Tool discovery finished; `tools` is populated and tool calls are
    /// legal.  This is the only state in which either is true.
    ToolsDiscovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting(ConnectingPhase),
    Connected(ConnectedPhase),
    Error,
    Disconnecting,
    DisconnectingDueToError,
    Aborting,
    /// Terminal — no transition leaves this state.
    Disposed,
}

/// What the owner wants the client to be.  `Disposed` is absorbing: once
/// set, the machine drives itself to `ClientState::Disposed` regardless of
/// its current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Connected,
    Disconnected,
    Disposed,
}

/// A tool discovered on the server, with its globally-addressable
/// (server-prefixed) name.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTool {
    /// `<server_id>_<remote_name>`.
    pub name: String,
    /// The name used on the wire when calling the server.
    pub remote_name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_id: String,
}

/// Snapshot published on every transition.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub state: ClientState,
    pub desired: DesiredState,
    pub last_error: Option<String>,
    pub pending_oauth_url: Option<String>,
    /// Empty unless `state == Connected(ToolsDiscovered)`.
    pub tools: Vec<DiscoveredTool>,
}

pub struct McpClientConfig {
    pub id: String,
    pub endpoint: McpServerEndpoint,
    pub connector: Arc<dyn Connector>,
    pub oauth: Option<Arc<dyn OAuthCallbackHandler>>,
    /// Initial desired state; registration connects eagerly.
    pub enabled: bool,
}

enum Command {
    SetDesiredEnabled(bool),
    Retry,
    Dispose,
    CallTool {
        remote_name: String,
        input: Value,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<ToolResult, McpError>>,
    },
}

/// Handle to a client actor.  Cloneable; the actor lives until every
/// handle is dropped or `dispose` completes and the channel drains.
#[derive(Clone)]
pub struct McpClient {
    id: String,
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ClientStatus>,
}

impl McpClient {
    /// Spawn the actor for one server.
    pub fn spawn(config: McpClientConfig) -> Self {
        let desired = if config.enabled {
            DesiredState::Connected
        } else {
            DesiredState::Disconnected
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(ClientStatus {
            state: ClientState::Disconnected,
            desired,
            last_error: None,
            pending_oauth_url: None,
            tools: vec![],
        });
        let id = config.id.clone();
        let actor = Actor {
            id: config.id,
            endpoint: config.endpoint,
            connector: config.connector,
            oauth: config.oauth,
            cmd_rx,
            status_tx,
            state: ClientState::Disconnected,
            desired,
            last_error: None,
            pending_oauth_url: None,
            tools: vec![],
            transport: None,
            bearer: None,
        };
        tokio::spawn(actor.run());
        Self {
            id,
            cmd_tx,
            status_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ClientStatus {
        self.status_rx.borrow().clone()
    }

    /// Stream of status snapshots, starting with the current one.
    pub fn status_stream(&self) -> WatchStream<ClientStatus> {
        WatchStream::new(self.status_rx.clone())
    }

    /// Discovered tools; empty unless in `connected.tool_discovered`.
    pub fn tools(&self) -> Vec<DiscoveredTool> {
        self.status_rx.borrow().tools.clone()
    }

    pub fn pending_oauth_url(&self) -> Option<String> {
        self.status_rx.borrow().pending_oauth_url.clone()
    }

    /// Flip the desired state; the machine reconciles asynchronously.
    pub async fn set_desired_enabled(&self, enabled: bool) {
        let _ = self.cmd_tx.send(Command::SetDesiredEnabled(enabled)).await;
    }

    /// From `error`, start a fresh connect attempt.
    pub async fn retry(&self) {
        let _ = self.cmd_tx.send(Command::Retry).await;
    }

    /// Drive the machine to `disposed` and wait for it (bounded).
    pub async fn dispose(&self) {
        let _ = self.cmd_tx.send(Command::Dispose).await;
        let _ = self
            .wait_for_state(Duration::from_secs(30), |s| {
                matches!(s.state, ClientState::Disposed)
            })
            .await;
    }

    /// Resolve once the machine reaches `connected.tool_discovered`.
    /// Errors on timeout, on `error`, on disposal, or when the desired
    /// state stops being `connected` while waiting.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), McpError> {
        let id = self.id.clone();
        let mut rx = self.status_rx.clone();
        let wait = async move {
            loop {
                let status = rx.borrow_and_update().clone();
                match status.state {
                    ClientState::Connected(ConnectedPhase::ToolsDiscovered) => return Ok(()),
                    ClientState::Error => {
                        return Err(McpError::Connection(
                            status
                                .last_error
                                .unwrap_or_else(|| "connection failed".into()),
                        ))
                    }
                    ClientState::Disposed => return Err(McpError::Disposed { id: id.clone() }),
                    _ => {}
                }
                if status.desired != DesiredState::Connected {
                    return Err(McpError::Connection(
                        "client was disabled while waiting for connection".into(),
                    ));
                }
                if rx.changed().await.is_err() {
                    return Err(McpError::Disposed { id: id.clone() });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| McpError::Timeout {
                what: format!("connection to {}", self.id),
            })?
    }

    /// Call a tool by its server-side (unprefixed) name.  Legal only in
    /// `connected.tool_discovered`.
    pub async fn execute_tool_call(
        &self,
        remote_name: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, McpError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CallTool {
                remote_name: remote_name.to_string(),
                input,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| McpError::Disposed {
                id: self.id.clone(),
            })?;
        reply_rx.await.map_err(|_| McpError::Disposed {
            id: self.id.clone(),
        })?
    }

    async fn wait_for_state(
        &self,
        timeout: Duration,
        pred: impl Fn(&ClientStatus) -> bool,
    ) -> Result<(), McpError> {
        let mut rx = self.status_rx.clone();
        let wait = async move {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| McpError::Timeout {
                what: format!("state change on {}", self.id),
            })
    }
}

// ─── Actor ───────────────────────────────────────────────────────────────────

enum Driven<T> {
    Done(T),
    /// The desired state changed away from `connected`; the in-flight
    /// attempt was abandoned.
    Interrupted,
}

struct Actor {
    id: String,
    endpoint: McpServerEndpoint,
    connector: Arc<dyn Connector>,
    oauth: Option<Arc<dyn OAuthCallbackHandler>>,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ClientStatus>,
    state: ClientState,
    desired: DesiredState,
    last_error: Option<String>,
    pending_oauth_url: Option<String>,
    tools: Vec<DiscoveredTool>,
    transport: Option<Box<dyn McpTransport>>,
    /// OAuth access token from a completed flow; reused on reconnects.
    bearer: Option<String>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            match (self.desired, self.state) {
                (DesiredState::Disposed, ClientState::Disposed) => break,
                (DesiredState::Disposed, _) => {
                    if self.transport.is_some() {
                        self.set_state(ClientState::Disconnecting);
                        self.close_transport().await;
                    }
                    self.tools.clear();
                    self.set_state(ClientState::Disposed);
                }
                (DesiredState::Connected, ClientState::Disconnected) => {
                    self.connect_cycle().await;
                }
                (DesiredState::Disconnected, ClientState::Connected(_)) => {
                    self.set_state(ClientState::Disconnecting);
                    self.close_transport().await;
                    self.tools.clear();
                    self.set_state(ClientState::Disconnected);
                }
                (DesiredState::Disconnected, ClientState::Error) => {
                    self.set_state(ClientState::Disconnected);
                }
                _ => {
                    // Steady state: wait for a command.
                    let Some(cmd) = self.cmd_rx.recv().await else {
                        // Every handle dropped — tear down.
                        self.desired = DesiredState::Disposed;
                        continue;
                    };
                    self.handle_steady_command(cmd).await;
                }
            }
        }
        debug!(server_id = %self.id, "client disposed");
        // Keep answering tool calls with a terminal error until the last
        // handle drops.
        while let Some(cmd) = self.cmd_rx.recv().await {
            if let Command::CallTool { reply, .. } = cmd {
                let _ = reply.send(Err(McpError::Disposed {
                    id: self.id.clone(),
                }));
            }
        }
    }

    fn publish(&self) {
        let tools = if self.state == ClientState::Connected(ConnectedPhase::ToolsDiscovered) {
            self.tools.clone()
        } else {
            vec![]
        };
        let _ = self.status_tx.send(ClientStatus {
            state: self.state,
            desired: self.desired,
            last_error: self.last_error.clone(),
            pending_oauth_url: self.pending_oauth_url.clone(),
            tools,
        });
    }

    fn set_state(&mut self, state: ClientState) {
        debug!(server_id = %self.id, ?state, "state transition");
        self.state = state;
        self.publish();
    }

    fn set_desired(&mut self, desired: DesiredState) {
        // Disposal is absorbing — nothing un-disposes a client.
        if self.desired == DesiredState::Disposed {
            return;
        }
        self.desired = desired;
        self.publish();
    }

    fn fail_connect(&mut self, err: McpError) {
        warn!(server_id = %self.id, error = %err, "connect attempt failed");
        self.last_error = Some(err.to_string());
        self.set_state(ClientState::Error);
    }

    async fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(server_id = %self.id, error = %e, "transport close failed");
            }
        }
    }

    async fn handle_steady_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetDesiredEnabled(true) => self.set_desired(DesiredState::Connected),
            Command::SetDesiredEnabled(false) => self.set_desired(DesiredState::Disconnected),
            Command::Dispose => self.set_desired(DesiredState::Disposed),
            Command::Retry => {
                if self.state == ClientState::Error && self.desired == DesiredState::Connected {
                    self.connect_cycle().await;
                }
            }
            Command::CallTool {
                remote_name,
                input,
                cancel,
                reply,
            } => {
                let result = self.call_tool(&remote_name, input, cancel).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn call_tool(
        &mut self,
        remote_name: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, McpError> {
        if self.state != ClientState::Connected(ConnectedPhase::ToolsDiscovered) {
            return Err(McpError::NotConnected {
                id: self.id.clone(),
            });
        }
        if !self.tools.iter().any(|t| t.remote_name == remote_name) {
            return Err(McpError::ToolNotFound {
                name: remote_name.to_string(),
            });
        }
        let raw = {
            let transport = self
                .transport
                .as_ref()
                .ok_or_else(|| McpError::NotConnected {
                    id: self.id.clone(),
                })?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(McpError::Cancelled),
                r = transport.call_tool(remote_name, input) => r,
            }
        };
        match raw {
            Ok(value) => bridge::normalize_tool_result(value),
            Err(McpError::Connection(msg)) => {
                // A runtime transport failure takes the whole client down.
                self.set_state(ClientState::DisconnectingDueToError);
                self.close_transport().await;
                self.tools.clear();
                self.last_error = Some(msg.clone());
                self.set_state(ClientState::Error);
                Err(McpError::Connection(msg))
            }
            Err(other) => Err(other),
        }
    }

    /// Poll `fut` while staying responsive to commands.  Commands that
    /// flip the desired state away from `connected` abandon the attempt:
    /// the machine enters `aborting` while the in-flight future is still
    /// alive; it is dropped when this returns, and the caller settles the
    /// abort through [`Actor::finish_abort`].
    async fn drive<T>(&mut self, fut: impl std::future::Future<Output = T>) -> Driven<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    if self.handle_connecting_command(cmd) {
                        self.set_state(ClientState::Aborting);
                        return Driven::Interrupted;
                    }
                }
                out = &mut fut => return Driven::Done(out),
            }
        }
    }

    /// Settle an abandoned connect attempt.  Entered in `aborting` with
    /// the in-flight future already dropped; yields once so status
    /// subscribers can observe the `aborting` transition before the
    /// machine settles to `disconnected`.
    async fn finish_abort(&mut self) {
        debug_assert_eq!(self.state, ClientState::Aborting);
        tokio::task::yield_now().await;
        self.set_state(ClientState::Disconnected);
    }

    /// Returns true when the in-flight connect attempt must be abandoned.
    fn handle_connecting_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            None => {
                self.desired = DesiredState::Disposed;
                true
            }
            Some(Command::SetDesiredEnabled(true)) => false,
            Some(Command::SetDesiredEnabled(false)) => {
                self.set_desired(DesiredState::Disconnected);
                !matches!(self.desired, DesiredState::Connected)
            }
            Some(Command::Dispose) => {
                self.set_desired(DesiredState::Disposed);
                true
            }
            Some(Command::Retry) => false,
            Some(Command::CallTool { reply, .. }) => {
                let _ = reply.send(Err(McpError::NotConnected {
                    id: self.id.clone(),
                }));
                false
            }
        }
    }

    async fn connect_cycle(&mut self) {
        self.last_error = None;
        self.pending_oauth_url = None;
        self.set_state(ClientState::Connecting(ConnectingPhase::Initial));

        // Phase 1: OAuth preflight (remote endpoints only; no-op for
        // command endpoints).
        let preflight = {
            let connector = Arc::clone(&self.connector);
            let endpoint = self.endpoint.clone();
            async move { connector.preflight(&endpoint).await }
        };
        let challenge = match self.drive(preflight).await {
            Driven::Interrupted => {
                self.finish_abort().await;
                return;
            }
            Driven::Done(Ok(challenge)) => challenge,
            Driven::Done(Err(e)) => {
                self.fail_connect(e);
                return;
            }
        };

        if let Some(metadata) = challenge {
            if self.bearer.is_none() {
                let Some(handler) = self.oauth.clone() else {
                    self.fail_connect(McpError::OAuth(
                        "server requires authorization but no oauth callback handler is configured"
                            .into(),
                    ));
                    return;
                };
                let pkce = PkceChallenge::generate();
                let redirect_uri = handler.redirect_uri();
                let authorize_url = match build_authorize_url(&metadata, &pkce, &redirect_uri) {
                    Ok(url) => url,
                    Err(e) => {
                        self.fail_connect(e);
                        return;
                    }
                };
                info!(server_id = %self.id, "suspending connect: awaiting oauth authorization");
                self.pending_oauth_url = Some(authorize_url.clone());
                self.set_state(ClientState::Connecting(ConnectingPhase::AwaitingOauth));
                handler.redirect_to_authorization(&authorize_url);

                let exchange = {
                    let connector = Arc::clone(&self.connector);
                    let handler = Arc::clone(&handler);
                    async move {
                        let code = handler.wait_for_callback().await?;
                        connector
                            .exchange_code(&metadata, &pkce, &code, &redirect_uri)
                            .await
                    }
                };
                match self.drive(exchange).await {
                    Driven::Interrupted => {
                        self.pending_oauth_url = None;
                        self.finish_abort().await;
                        return;
                    }
                    Driven::Done(Ok(token)) => {
                        self.bearer = Some(token);
                        self.pending_oauth_url = None;
                        self.set_state(ClientState::Connecting(ConnectingPhase::Initial));
                    }
                    Driven::Done(Err(e)) => {
                        self.pending_oauth_url = None;
                        self.fail_connect(e);
                        return;
                    }
                }
            }
        }

        // Phase 2: open the transport.
        let connect = {
            let connector = Arc::clone(&self.connector);
            let endpoint = self.endpoint.clone();
            let id = self.id.clone();
            let bearer = self.bearer.clone();
            async move { connector.connect(&id, &endpoint, bearer.as_deref()).await }
        };
        let transport = match self.drive(connect).await {
            Driven::Interrupted => {
                self.finish_abort().await;
                return;
            }
            Driven::Done(Ok(t)) => t,
            Driven::Done(Err(e)) => {
                self.fail_connect(e);
                return;
            }
        };
        self.transport = Some(transport);
        self.set_state(ClientState::Connected(ConnectedPhase::Initial));

        // Phase 3: discover tools.  The transport moves into the future so
        // discovery can run while commands are still being answered.
        let transport = self.transport.take().expect("transport just stored");
        let discover = async move {
            let tools = transport.list_tools().await;
            (transport, tools)
        };
        match self.drive(discover).await {
            // Abandoned mid-discovery — the moved transport is dropped
            // with the future.
            Driven::Interrupted => {
                self.finish_abort().await;
            }
            Driven::Done((transport, Ok(raw))) => {
                self.transport = Some(transport);
                self.tools = raw
                    .into_iter()
                    .map(|t| DiscoveredTool {
                        name: bridge::prefixed_tool_name(&self.id, &t.name),
                        remote_name: t.name,
                        description: t.description,
                        input_schema: t.input_schema,
                        server_id: self.id.clone(),
                    })
                    .collect();
                info!(
                    server_id = %self.id,
                    tool_count = self.tools.len(),
                    "tool discovery complete"
                );
                self.set_state(ClientState::Connected(ConnectedPhase::ToolsDiscovered));
            }
            Driven::Done((transport, Err(e))) => {
                self.set_state(ClientState::DisconnectingDueToError);
                if let Err(close_err) = transport.close().await {
                    warn!(server_id = %self.id, error = %close_err, "transport close failed");
                }
                self.fail_connect(e);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::{oauth::AuthorizationServerMetadata, transport::RawToolInfo};

    use super::*;

    // ── Test doubles ─────────────────────────────────────────────────────────

    struct MockTransport {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        async fn list_tools(&self) -> Result<Vec<RawToolInfo>, McpError> {
            Ok(vec![RawToolInfo {
                name: "search".into(),
                description: "searches".into(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, name: &str, input: Value) -> Result<Value, McpError> {
            Ok(json!({
                "content": [{"type": "text", "text": format!("{name}:{input}")}]
            }))
        }

        async fn close(self: Box<Self>) -> Result<(), McpError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        /// Connect attempts that fail before the first success.
        failures_remaining: AtomicUsize,
        /// Delay applied to every connect, for abort tests.
        connect_delay_ms: u64,
        requires_oauth: bool,
        connects: AtomicUsize,
        exchanged_codes: Mutex<Vec<String>>,
        closed: Arc<AtomicUsize>,
    }

    impl MockConnector {
        fn failing(n: usize) -> Self {
            let c = Self::default();
            c.failures_remaining.store(n, Ordering::SeqCst);
            c
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn preflight(
            &self,
            endpoint: &McpServerEndpoint,
        ) -> Result<Option<AuthorizationServerMetadata>, McpError> {
            if self.requires_oauth && matches!(endpoint, McpServerEndpoint::Remote { .. }) {
                Ok(Some(AuthorizationServerMetadata {
                    authorization_endpoint: "https://auth.example/authorize".into(),
                    token_endpoint: "https://auth.example/token".into(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn exchange_code(
            &self,
            _metadata: &AuthorizationServerMetadata,
            _pkce: &PkceChallenge,
            code: &str,
            _redirect_uri: &str,
        ) -> Result<String, McpError> {
            self.exchanged_codes.lock().unwrap().push(code.to_string());
            Ok(format!("token-for-{code}"))
        }

        async fn connect(
            &self,
            _id: &str,
            _endpoint: &McpServerEndpoint,
            bearer: Option<&str>,
        ) -> Result<Box<dyn McpTransport>, McpError> {
            if self.connect_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.connect_delay_ms)).await;
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(McpError::Connection("simulated connect failure".into()));
            }
            if self.requires_oauth && bearer.is_none() {
                return Err(McpError::Connection("401 unauthorized".into()));
            }
            Ok(Box::new(MockTransport {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    struct MockOAuthHandler {
        code: String,
        redirected_to: Mutex<Option<String>>,
    }

    #[async_trait]
    impl OAuthCallbackHandler for MockOAuthHandler {
        fn redirect_uri(&self) -> String {
            "http://127.0.0.1:7878/callback".into()
        }

        fn redirect_to_authorization(&self, url: &str) {
            *self.redirected_to.lock().unwrap() = Some(url.to_string());
        }

        async fn wait_for_callback(&self) -> Result<String, McpError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(self.code.clone())
        }
    }

    fn spawn_client(connector: Arc<MockConnector>, enabled: bool) -> McpClient {
        McpClient::spawn(McpClientConfig {
            id: "srv".into(),
            endpoint: McpServerEndpoint::command("server-bin", vec![]),
            connector,
            oauth: None,
            enabled,
        })
    }

    // ── Connect / discovery ──────────────────────────────────────────────────

    #[tokio::test]
    async fn connects_and_discovers_tools() {
        let client = spawn_client(Arc::new(MockConnector::default()), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        let tools = client.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "srv_search");
        assert_eq!(tools[0].remote_name, "search");
    }

    #[tokio::test]
    async fn tools_empty_when_disabled() {
        let client = spawn_client(Arc::new(MockConnector::default()), false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.tools().is_empty());
        assert_eq!(client.status().state, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_reaches_error_and_retry_recovers() {
        let connector = Arc::new(MockConnector::failing(1));
        let client = spawn_client(Arc::clone(&connector), true);

        let err = client.wait_for_connection(Duration::from_secs(1)).await;
        assert!(matches!(err, Err(McpError::Connection(_))));
        assert_eq!(client.status().state, ClientState::Error);
        assert!(client.status().last_error.is_some());

        client.retry().await;
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disable_disconnects_and_clears_tools() {
        let connector = Arc::new(MockConnector::default());
        let client = spawn_client(Arc::clone(&connector), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();

        client.set_desired_enabled(false).await;
        client
            .wait_for_state(Duration::from_secs(1), |s| {
                s.state == ClientState::Disconnected
            })
            .await
            .unwrap();
        assert!(client.tools().is_empty());
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disable_mid_connect_aborts_attempt() {
        let connector = Arc::new(MockConnector {
            connect_delay_ms: 5_000,
            ..MockConnector::default()
        });
        let client = spawn_client(Arc::clone(&connector), true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            client.status().state,
            ClientState::Connecting(ConnectingPhase::Initial)
        );

        client.set_desired_enabled(false).await;
        client
            .wait_for_state(Duration::from_secs(1), |s| {
                s.state == ClientState::Disconnected
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn abort_transition_is_observable_on_status_stream() {
        use tokio_stream::StreamExt;

        let connector = Arc::new(MockConnector {
            connect_delay_ms: 5_000,
            ..MockConnector::default()
        });
        let client = spawn_client(connector, true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            client.status().state,
            ClientState::Connecting(ConnectingPhase::Initial)
        );

        // Subscribe before disabling so the subscriber is polled between
        // the `aborting` and `disconnected` transitions.
        let mut stream = client.status_stream();
        let states = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(status) = stream.next().await {
                let done = status.state == ClientState::Disconnected;
                seen.push(status.state);
                if done {
                    break;
                }
            }
            seen
        });

        client.set_desired_enabled(false).await;
        let seen = tokio::time::timeout(Duration::from_secs(1), states)
            .await
            .unwrap()
            .unwrap();

        let aborting = seen
            .iter()
            .position(|s| *s == ClientState::Aborting)
            .expect("aborting must be observable mid-connect");
        let disconnected = seen
            .iter()
            .position(|s| *s == ClientState::Disconnected)
            .expect("machine must settle to disconnected");
        assert!(aborting < disconnected, "aborting precedes disconnected");
    }

    #[tokio::test]
    async fn reenable_after_disable_converges_to_discovered() {
        let client = spawn_client(Arc::new(MockConnector::default()), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        client.set_desired_enabled(false).await;
        client
            .wait_for_state(Duration::from_secs(1), |s| {
                s.state == ClientState::Disconnected
            })
            .await
            .unwrap();
        client.set_desired_enabled(true).await;
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
    }

    // ── Disposal ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn dispose_is_terminal() {
        let client = spawn_client(Arc::new(MockConnector::default()), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        client.dispose().await;
        assert_eq!(client.status().state, ClientState::Disposed);

        // No transition out of disposed, even when re-enabled.
        client.set_desired_enabled(true).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.status().state, ClientState::Disposed);
    }

    #[tokio::test]
    async fn tool_call_after_dispose_errors() {
        let client = spawn_client(Arc::new(MockConnector::default()), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        client.dispose().await;
        let err = client
            .execute_tool_call("search", json!({}), CancellationToken::new())
            .await;
        assert!(matches!(err, Err(McpError::Disposed { .. })));
    }

    #[tokio::test]
    async fn dispose_while_connecting_converges() {
        let connector = Arc::new(MockConnector {
            connect_delay_ms: 5_000,
            ..MockConnector::default()
        });
        let client = spawn_client(connector, true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.dispose().await;
        assert_eq!(client.status().state, ClientState::Disposed);
    }

    // ── Tool calls ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_tool_call_normalizes_result() {
        let client = spawn_client(Arc::new(MockConnector::default()), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        let result = client
            .execute_tool_call("search", json!({"q": "x"}), CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.text_content().starts_with("search:"));
    }

    #[tokio::test]
    async fn tool_call_before_discovery_is_rejected() {
        let connector = Arc::new(MockConnector {
            connect_delay_ms: 5_000,
            ..MockConnector::default()
        });
        let client = spawn_client(connector, true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = client
            .execute_tool_call("search", json!({}), CancellationToken::new())
            .await;
        assert!(matches!(err, Err(McpError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let client = spawn_client(Arc::new(MockConnector::default()), true);
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        let err = client
            .execute_tool_call("nope", json!({}), CancellationToken::new())
            .await;
        assert!(matches!(err, Err(McpError::ToolNotFound { .. })));
    }

    // ── OAuth ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn oauth_flow_suspends_then_connects() {
        let connector = Arc::new(MockConnector {
            requires_oauth: true,
            ..MockConnector::default()
        });
        let handler = Arc::new(MockOAuthHandler {
            code: "auth-code-1".into(),
            redirected_to: Mutex::new(None),
        });
        let client = McpClient::spawn(McpClientConfig {
            id: "remote".into(),
            endpoint: McpServerEndpoint::remote("https://mcp.example/mcp"),
            connector: Arc::clone(&connector),
            oauth: Some(Arc::clone(&handler) as Arc<dyn OAuthCallbackHandler>),
            enabled: true,
        });

        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();

        // The handler saw the authorization URL with PKCE parameters.
        let url = handler.redirected_to.lock().unwrap().clone().unwrap();
        assert!(url.starts_with("https://auth.example/authorize?"));
        assert!(url.contains("code_challenge_method=S256"));

        // The code round-tripped through the exchange.
        assert_eq!(
            connector.exchanged_codes.lock().unwrap().as_slice(),
            ["auth-code-1"]
        );

        // Once discovered, the pending url is gone and tools are visible.
        assert!(client.pending_oauth_url().is_none());
        assert_eq!(client.tools().len(), 1);
    }

    #[tokio::test]
    async fn oauth_without_handler_is_an_error() {
        let connector = Arc::new(MockConnector {
            requires_oauth: true,
            ..MockConnector::default()
        });
        let client = McpClient::spawn(McpClientConfig {
            id: "remote".into(),
            endpoint: McpServerEndpoint::remote("https://mcp.example/mcp"),
            connector,
            oauth: None,
            enabled: true,
        });
        let err = client.wait_for_connection(Duration::from_secs(1)).await;
        assert!(err.is_err());
        assert_eq!(client.status().state, ClientState::Error);
    }

    #[tokio::test]
    async fn pending_oauth_url_visible_while_awaiting() {
        struct NeverHandler;
        #[async_trait]
        impl OAuthCallbackHandler for NeverHandler {
            fn redirect_uri(&self) -> String {
                "http://127.0.0.1:7878/callback".into()
            }
            fn redirect_to_authorization(&self, _url: &str) {}
            async fn wait_for_callback(&self) -> Result<String, McpError> {
                std::future::pending().await
            }
        }
        let connector = Arc::new(MockConnector {
            requires_oauth: true,
            ..MockConnector::default()
        });
        let client = McpClient::spawn(McpClientConfig {
            id: "remote".into(),
            endpoint: McpServerEndpoint::remote("https://mcp.example/mcp"),
            connector,
            oauth: Some(Arc::new(NeverHandler)),
            enabled: true,
        });
        client
            .wait_for_state(Duration::from_secs(1), |s| {
                s.state == ClientState::Connecting(ConnectingPhase::AwaitingOauth)
            })
            .await
            .unwrap();
        assert!(client.pending_oauth_url().is_some());
    }
}
