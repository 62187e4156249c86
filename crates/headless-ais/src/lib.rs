//! Headless authentication proxy for the NTHU CCXP academic information system.
//!
//! The Academic System has no API: it serves Big5 HTML behind a CAPTCHA-guarded
//! login form and identifies sessions with an opaque `ACIXSTORE` query token.
//! This crate performs the login handshake, keeps exactly one current token,
//! refreshes it when a page reports the session as interrupted, and exposes a
//! single authenticated fetch to data adapters.
//!
//! ```no_run
//! use headless_ais::{AisConfig, HeadlessAis};
//!
//! # async fn run() -> headless_ais::Result<()> {
//! let mut config = AisConfig::default();
//! config.ocr.endpoint = Some("http://127.0.0.1:8000/ocr".to_string());
//!
//! let ais = HeadlessAis::builder(config).build().await?;
//! ais.remember("110000000", "hunter2").await?;
//! let page = ais.request_text("JH/6/6.2/6.2.9/JH629001.php", &[]).await?;
//! println!("{page}");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod captcha;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod html;
pub mod http;
pub mod login;
pub mod portal;
pub mod session;
pub mod vault;

pub use bridge::{DownstreamKind, DownstreamToken, SecondarySystem, TokenBridge};
pub use captcha::{AssetFilter, CaptchaDecoder, CaptchaShape, RemoteOcrDecoder};
pub use client::{HeadlessAis, HeadlessAisBuilder};
pub use config::AisConfig;
pub use error::{BridgeError, Error, GatewayError, LoginError, Result, VaultError};
pub use gateway::{RequestGateway, RetryPolicy};
pub use session::{SessionEvent, SessionManager, SessionToken};
pub use vault::{Credential, CredentialVault, VaultKey};
