//! The assembled proxy: vault, login machine, session manager, gateway and
//! token bridge wired together from one [`AisConfig`].

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::Client;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::bridge::{DownstreamKind, DownstreamToken, SecondarySystem, TokenBridge};
use crate::captcha::{AssetFilter, CaptchaDecoder, CaptchaResolver, RemoteOcrDecoder};
use crate::config::{AisConfig, VaultConfig};
use crate::error::{BridgeError, Error, GatewayError, LoginError, Result, VaultError};
use crate::gateway::{RequestGateway, RetryPolicy};
use crate::http::create_client;
use crate::login::LoginMachine;
use crate::portal::{AisPortal, HttpPortal};
use crate::session::{SessionEvent, SessionManager, SessionToken};
use crate::vault::{Credential, CredentialVault, FileVaultStore, VaultKey};

/// Builder for [`HeadlessAis`].
pub struct HeadlessAisBuilder {
    config: AisConfig,
    client: Option<Client>,
    decoder: Option<Arc<dyn CaptchaDecoder>>,
    filter: Option<Arc<dyn AssetFilter>>,
    vault: Option<Arc<CredentialVault>>,
    portal: Option<Arc<dyn AisPortal>>,
}

impl HeadlessAisBuilder {
    /// Use a custom CAPTCHA decoder instead of the configured OCR endpoint.
    pub fn with_decoder(mut self, decoder: Arc<dyn CaptchaDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Pre-process every CAPTCHA image before it reaches the decoder.
    pub fn with_asset_filter(mut self, filter: Arc<dyn AssetFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_vault(mut self, vault: Arc<CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Share an existing HTTP client. It must not follow redirects.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_portal(mut self, portal: Arc<dyn AisPortal>) -> Self {
        self.portal = Some(portal);
        self
    }

    /// Assemble the proxy and start following session changes.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<HeadlessAis> {
        let config = self.config;
        let client = match self.client {
            Some(client) => client,
            None => create_client(&config.http)?,
        };

        let portal: Arc<dyn AisPortal> = match self.portal {
            Some(portal) => portal,
            None => Arc::new(HttpPortal::new(client.clone(), config.portal.clone())?),
        };

        let decoder: Arc<dyn CaptchaDecoder> = match (self.decoder, &config.ocr.endpoint) {
            (Some(decoder), _) => decoder,
            (None, Some(endpoint)) => {
                let endpoint = Url::parse(endpoint)
                    .map_err(|e| Error::Config(format!("ocr.endpoint {endpoint}: {e}")))?;
                Arc::new(RemoteOcrDecoder::new(client.clone(), endpoint))
            }
            (None, None) => {
                return Err(Error::Config(
                    "no captcha decoder: set ocr.endpoint or supply one".to_string(),
                ));
            }
        };

        let vault = match self.vault {
            Some(vault) => vault,
            None => Arc::new(open_vault(&config.vault).await?),
        };

        let mut resolver =
            CaptchaResolver::new(config.portal.captcha_shape, config.login.max_captcha_attempts);
        if let Some(filter) = self.filter {
            resolver = resolver.with_filter(filter);
        }
        let machine = LoginMachine::new(
            Arc::clone(&portal),
            Arc::clone(&vault),
            decoder,
            resolver,
            config.login.clone(),
            config.portal.markers.clone(),
        );
        let session = Arc::new(SessionManager::new(Arc::new(machine), Arc::clone(&vault)));

        let bridge = Arc::new(TokenBridge::new(client, &config.bridge));
        let shutdown = CancellationToken::new();
        bridge.spawn_watcher(session.subscribe(), shutdown.child_token());

        let gateway = RequestGateway::new(
            portal,
            Arc::clone(&session),
            bridge,
            config.portal.markers.clone(),
        );

        info!(base_url = %config.portal.base_url, "Headless AIS ready");
        Ok(HeadlessAis {
            gateway,
            session,
            vault,
            shutdown,
        })
    }
}

/// Open the on-disk vault described by `config`, or an in-memory one when no
/// credential path is set.
///
/// An unreadable key still yields a vault, so the stale entry can be cleared
/// on the next unlock.
async fn open_vault(config: &VaultConfig) -> Result<CredentialVault> {
    let Some(credential_path) = &config.credential_path else {
        return Ok(CredentialVault::in_memory());
    };
    let store = Arc::new(FileVaultStore::new(credential_path.clone()));
    let key_path = config
        .key_path
        .clone()
        .unwrap_or_else(|| default_key_path(credential_path));

    match VaultKey::load_or_create(&key_path).await {
        Ok(key) => Ok(CredentialVault::new(key, store)),
        Err(e) if e.is_unusable() => {
            warn!(path = %key_path.display(), error = %e, "Vault key unavailable");
            Ok(CredentialVault::without_key(store))
        }
        Err(e) => Err(e.into()),
    }
}

fn default_key_path(credential_path: &std::path::Path) -> PathBuf {
    credential_path.with_extension("key")
}

/// Headless authentication proxy for the Academic System.
pub struct HeadlessAis {
    gateway: RequestGateway,
    session: Arc<SessionManager>,
    vault: Arc<CredentialVault>,
    shutdown: CancellationToken,
}

impl HeadlessAis {
    pub fn builder(config: AisConfig) -> HeadlessAisBuilder {
        HeadlessAisBuilder {
            config,
            client: None,
            decoder: None,
            filter: None,
            vault: None,
            portal: None,
        }
    }

    /// Encrypt and store the account credential.
    ///
    /// A session belonging to a different account is dropped.
    pub async fn remember(&self, identifier: &str, secret: &str) -> Result<Credential> {
        let credential = self.vault.store(identifier, secret).await?;
        if let Some(current) = self.session.current()
            && current.source_identifier != identifier
        {
            self.session.invalidate(&current);
        }
        Ok(credential)
    }

    /// Log in now, or return the current token.
    pub async fn login(&self) -> Result<SessionToken, LoginError> {
        self.session.acquire(&CancellationToken::new()).await
    }

    /// Forget the session and the stored credential.
    pub async fn logout(&self) -> Result<(), VaultError> {
        self.session.logout().await
    }

    pub async fn request(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Bytes, GatewayError> {
        self.gateway.request(path, params).await
    }

    pub async fn request_text(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<String, GatewayError> {
        self.gateway.request_text(path, params).await
    }

    pub async fn request_with_retry(
        &self,
        path: &str,
        params: &[(&str, &str)],
        policy: &RetryPolicy,
    ) -> Result<Bytes, GatewayError> {
        self.gateway.request_with_retry(path, params, policy).await
    }

    pub async fn secondary_token(
        &self,
        system: SecondarySystem,
        kind: DownstreamKind,
    ) -> Result<DownstreamToken, BridgeError> {
        self.gateway.secondary_token(system, kind).await
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events()
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }
}

impl Drop for HeadlessAis {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
