use std::sync::Arc;

use reqwest::Client;
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;

use crate::config::HttpConfig;
use crate::error::{Error, Result};

/// Build the HTTP client shared by the portal and the token bridge.
///
/// Redirects are never followed: the session token and the secondary-system
/// codes arrive in `Location` headers.
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("tls protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| Error::Config(format!("platform verifier: {e}")))?
        .with_no_client_auth();

    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .use_preconfigured_tls(tls_config)
        .redirect(reqwest::redirect::Policy::none());

    if !config.timeout().is_zero() {
        builder = builder.timeout(config.timeout());
    }
    if !config.connect_timeout().is_zero() {
        builder = builder.connect_timeout(config.connect_timeout());
    }

    builder.build().map_err(Error::from)
}
