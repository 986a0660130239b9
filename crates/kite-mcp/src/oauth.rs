// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OAuth authorization-code flow (with PKCE) for remote MCP servers.
//!
//! A remote endpoint whose handshake returns 401 while advertising
//! `oauth-authorization-server` metadata suspends the connect in the
//! `connecting.awaiting_oauth` substate.  The client never opens a browser
//! or runs a callback server itself; both sides of the redirect are
//! delegated to an injected [`OAuthCallbackHandler`] so embedders decide
//! how the authorization code is obtained.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::McpError;

/// OAuth 2.0 authorization-server metadata (RFC 8414), reduced to the
/// fields the client consumes.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthorizationServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

/// Embedder-supplied half of the OAuth redirect.
#[async_trait]
pub trait OAuthCallbackHandler: Send + Sync {
    /// The redirect URI registered for this client (e.g. a loopback URL
    /// served by the embedder).
    fn redirect_uri(&self) -> String;

    /// Present the authorization URL to the user (open a browser, print
    /// a link — the core does not care).
    fn redirect_to_authorization(&self, url: &str);

    /// Resolve once the user completed authorization; yields the
    /// authorization code.
    async fn wait_for_callback(&self) -> Result<String, McpError>;
}

/// A PKCE verifier/challenge pair (RFC 7636, S256 method).
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        Self::from_verifier(verifier)
    }

    /// Derive the S256 challenge from an explicit verifier.  Split out so
    /// tests can use a fixed verifier.
    pub fn from_verifier(verifier: String) -> Self {
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(digest);
        Self {
            verifier,
            challenge,
        }
    }
}

/// Client identifier presented during authorization.  Dynamic client
/// registration is out of scope; servers that require a registered client
/// id accept it through endpoint headers instead.
pub(crate) const CLIENT_ID: &str = "kite-mcp";

/// Build the authorization URL the user is redirected to.
pub(crate) fn build_authorize_url(
    metadata: &AuthorizationServerMetadata,
    pkce: &PkceChallenge,
    redirect_uri: &str,
) -> Result<String, McpError> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| McpError::OAuth(format!("bad authorization_endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

/// Token endpoint response, reduced to the field the client consumes.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
