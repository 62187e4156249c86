//! Downstream token bridge.
//!
//! Trades the primary session token for credentials of secondary systems
//! (learning platform, dormitory/parcel) by walking a [`BridgeChain`]. Tokens
//! are cached per parent session token and purged when it is replaced.

mod cache;
mod chain;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::session::SessionToken;

pub use cache::TokenCache;
pub use chain::{
    BridgeChain, BridgeStep, Extracted, Extractor, HttpMethod, RenderedRequest, RequestTemplate,
    parse_set_cookies,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondarySystem {
    LearningPlatform,
    Dormitory,
}

impl SecondarySystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LearningPlatform => "learning_platform",
            Self::Dormitory => "dormitory",
        }
    }
}

impl fmt::Display for SecondarySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecondarySystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "learning_platform" | "elearn" => Ok(Self::LearningPlatform),
            "dormitory" | "dorm" => Ok(Self::Dormitory),
            other => Err(format!("unknown secondary system: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownstreamKind {
    #[serde(rename = "oauth_code")]
    SecondaryOAuthCode,
    #[serde(rename = "access_token")]
    SecondaryAccessToken,
    #[serde(rename = "platform_cookie")]
    SecondaryPlatformCookie,
}

impl DownstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecondaryOAuthCode => "oauth_code",
            Self::SecondaryAccessToken => "access_token",
            Self::SecondaryPlatformCookie => "platform_cookie",
        }
    }
}

impl fmt::Display for DownstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownstreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth_code" | "code" => Ok(Self::SecondaryOAuthCode),
            "access_token" | "token" => Ok(Self::SecondaryAccessToken),
            "platform_cookie" | "cookie" => Ok(Self::SecondaryPlatformCookie),
            other => Err(format!("unknown downstream token kind: {other}")),
        }
    }
}

/// A credential for a secondary system, derived from one session token.
#[derive(Clone, PartialEq, Eq)]
pub struct DownstreamToken {
    pub system: SecondarySystem,
    pub kind: DownstreamKind,
    /// Value of the session token this was derived from.
    pub parent: String,
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for DownstreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamToken")
            .field("system", &self.system)
            .field("kind", &self.kind)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Interpreter for [`BridgeChain`]s with a per-parent token cache.
pub struct TokenBridge {
    client: Client,
    chains: HashMap<SecondarySystem, BridgeChain>,
    vars: HashMap<String, String>,
    cache: TokenCache,
}

impl TokenBridge {
    /// `client` must not follow redirects.
    pub fn new(client: Client, config: &BridgeConfig) -> Self {
        Self {
            client,
            chains: chain::chains_from_config(config),
            vars: chain::base_vars(config),
            cache: TokenCache::new(),
        }
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Produce a `kind` token for `system` derived from `parent`.
    ///
    /// Cached hops derived from the same parent are reused; the chain resumes
    /// after the deepest reusable one.
    #[instrument(skip(self, parent), fields(generation = parent.generation))]
    pub async fn exchange(
        &self,
        system: SecondarySystem,
        kind: DownstreamKind,
        parent: &SessionToken,
    ) -> Result<DownstreamToken, BridgeError> {
        let chain = self
            .chains
            .get(&system)
            .ok_or(BridgeError::UnknownChain { system, kind })?;
        let target = chain
            .position(kind)
            .ok_or(BridgeError::UnknownChain { system, kind })?;

        if !chain.steps[target].single_use
            && let Some(cached) = self.cache.get(system, kind, &parent.value)
        {
            debug!("Serving downstream token from cache");
            return Ok(cached);
        }

        let (start, mut previous) = self.resume_point(chain, target, &parent.value);
        if start > 0 {
            debug!(resume_at = start, "Resuming chain from cached hop");
        }

        let mut produced = None;
        for (index, step) in chain.steps.iter().enumerate().take(target + 1).skip(start) {
            let extracted = self
                .hop(system, index, step, parent, previous.as_deref())
                .await?;
            let token = DownstreamToken {
                system,
                kind: step.kind,
                parent: parent.value.clone(),
                value: extracted.value,
                expires_at: extracted.expires_at,
            };
            if !step.single_use && !self.cache.insert(token.clone()) {
                debug!(kind = %step.kind, "Parent superseded during exchange, not caching");
            }
            previous = Some(token.value.clone());
            produced = Some(token);
        }

        let token = produced.ok_or_else(|| BridgeError::Hop {
            system,
            kind,
            step: target,
            reason: "chain produced no token".to_string(),
        })?;
        info!(%system, %kind, "Downstream token exchanged");
        Ok(token)
    }

    /// First step to run and the value feeding it.
    fn resume_point(
        &self,
        chain: &BridgeChain,
        target: usize,
        parent: &str,
    ) -> (usize, Option<String>) {
        for index in (0..target).rev() {
            let step = &chain.steps[index];
            if step.single_use {
                continue;
            }
            if let Some(cached) = self.cache.get(chain.system, step.kind, parent) {
                return (index + 1, Some(cached.value));
            }
        }
        (0, None)
    }

    async fn hop(
        &self,
        system: SecondarySystem,
        index: usize,
        step: &BridgeStep,
        parent: &SessionToken,
        previous: Option<&str>,
    ) -> Result<Extracted, BridgeError> {
        let hop_error = |reason: String| BridgeError::Hop {
            system,
            kind: step.kind,
            step: index,
            reason,
        };
        let network_error = |source: reqwest::Error| BridgeError::Network {
            system,
            kind: step.kind,
            step: index,
            source,
        };

        let mut vars: HashMap<&str, &str> = self
            .vars
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        vars.insert("acixstore", parent.value.as_str());
        if let Some(previous) = previous {
            vars.insert("previous", previous);
        }
        let rendered = step.request.render(&vars).map_err(BridgeError::Template)?;

        let request = match rendered.method {
            HttpMethod::Get => self.client.get(rendered.url.clone()),
            HttpMethod::Post => self.client.post(rendered.url.clone()).form(&rendered.form),
        };
        debug!(step = index, kind = %step.kind, host = ?rendered.url.host_str(), "Bridge hop");
        let response = request.send().await.map_err(network_error)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(hop_error(format!("HTTP {status}")));
        }

        if step.extractor.needs_body() {
            let body = response.text().await.map_err(network_error)?;
            step.extractor.from_body(&body).map_err(hop_error)
        } else {
            step.extractor
                .from_headers(&rendered.url, response.headers())
                .map_err(hop_error)
        }
    }

    /// Purge every token not derived from `current`.
    pub fn on_session_change(&self, current: Option<&SessionToken>) {
        let purged = self
            .cache
            .retain_parent(current.map(|t| t.value.as_str()));
        if purged > 0 {
            debug!(purged, "Purged downstream tokens of superseded session");
        }
    }

    /// Follow session token replacements until `cancel` fires or the sender
    /// is dropped.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        mut tokens: watch::Receiver<Option<SessionToken>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = tokens.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = tokens.borrow_and_update().clone();
                        bridge.on_session_change(current.as_ref());
                    }
                }
            }
        })
    }
}
