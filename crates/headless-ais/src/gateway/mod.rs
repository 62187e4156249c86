//! Authenticated access to Academic System pages.
//!
//! Data adapters hand the gateway a path and get back a page body. The
//! gateway attaches the current token, recognises rejection pages, and lets
//! the session manager refresh once before giving up.

mod retry;

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::bridge::{DownstreamKind, DownstreamToken, SecondarySystem, TokenBridge};
use crate::config::MarkerConfig;
use crate::error::{BridgeError, GatewayError};
use crate::html::{contains_any, decode_big5, excerpt};
use crate::portal::{AisPortal, PageResponse};
use crate::session::{SessionManager, TokenUse};

pub use retry::{RetryClass, RetryPolicy};

/// Entry point for every authenticated Academic System request.
#[derive(Clone)]
pub struct RequestGateway {
    portal: Arc<dyn AisPortal>,
    session: Arc<SessionManager>,
    bridge: Arc<TokenBridge>,
    markers: MarkerConfig,
}

impl RequestGateway {
    pub fn new(
        portal: Arc<dyn AisPortal>,
        session: Arc<SessionManager>,
        bridge: Arc<TokenBridge>,
        markers: MarkerConfig,
    ) -> Self {
        Self {
            portal,
            session,
            bridge,
            markers,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Fetch `path` with the current token and return the raw body.
    pub async fn request(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Bytes, GatewayError> {
        self.request_cancellable(path, params, &CancellationToken::new())
            .await
    }

    /// Like [`request`](Self::request), decoding the Big5 body.
    pub async fn request_text(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<String, GatewayError> {
        let body = self.request(path, params).await?;
        Ok(decode_big5(&body))
    }

    #[instrument(skip(self, params, cancel))]
    pub async fn request_cancellable(
        &self,
        path: &str,
        params: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Bytes, GatewayError> {
        let path = normalize_path(path)?;

        self.session
            .with_token_cancellable(
                |token| async move {
                    match self.portal.fetch_page(path, &token.value, params).await {
                        Ok(page) => classify_page(path, page, &self.markers),
                        Err(e) => TokenUse::Failed(e.into()),
                    }
                },
                cancel,
            )
            .await
    }

    /// Fetch `path`, retrying outages as `policy` allows.
    ///
    /// Session expiry and invalid paths are never retried.
    pub async fn request_with_retry(
        &self,
        path: &str,
        params: &[(&str, &str)],
        policy: &RetryPolicy,
    ) -> Result<Bytes, GatewayError> {
        let cancel = CancellationToken::new();
        let token = &cancel;
        retry::run(policy, token, path, move || {
            self.request_cancellable(path, params, token)
        })
        .await
    }

    /// Exchange the current session for a secondary-system token.
    ///
    /// Bridge failures never invalidate the primary session.
    pub async fn secondary_token(
        &self,
        system: SecondarySystem,
        kind: DownstreamKind,
    ) -> Result<DownstreamToken, BridgeError> {
        let token = self
            .session
            .acquire(&CancellationToken::new())
            .await
            .map_err(|e| BridgeError::Session(e.into()))?;
        self.bridge.exchange(system, kind, &token).await
    }
}

fn normalize_path(path: &str) -> Result<&str, GatewayError> {
    let path = path.trim();
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains("://") || path.starts_with("//") {
        return Err(GatewayError::InvalidPath(path.to_string()));
    }
    Ok(trimmed)
}

/// Decide what a fetched page means for the token that fetched it.
fn classify_page(path: &str, page: PageResponse, markers: &MarkerConfig) -> TokenUse<Bytes> {
    let status = page.status;

    if status.is_server_error() {
        return TokenUse::Failed(GatewayError::upstream(
            Some(status.as_u16()),
            format!("{path} returned HTTP {status}"),
        ));
    }

    // A redirect back to the login page means the token is gone.
    if status.is_redirection() {
        let location = page.location.as_deref().unwrap_or_default();
        if location.is_empty() || !location.contains("ACIXSTORE=") {
            debug!(path, location, "Redirected away from content page");
            return TokenUse::Rejected;
        }
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return TokenUse::Rejected;
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return TokenUse::Failed(GatewayError::InvalidPath(path.to_string()));
    }

    let text = decode_big5(&page.body);
    if contains_any(&text, &markers.session_expired) {
        debug!(path, "Session-expired page returned");
        return TokenUse::Rejected;
    }
    if contains_any(&text, &markers.maintenance) {
        warn!(path, excerpt = %excerpt(&text, 120), "Academic System under maintenance");
        return TokenUse::Failed(GatewayError::maintenance(Some(status.as_u16())));
    }
    if status.is_client_error() {
        return TokenUse::Failed(GatewayError::upstream(
            Some(status.as_u16()),
            format!("{path} returned HTTP {status}"),
        ));
    }

    TokenUse::Done(page.body)
}
