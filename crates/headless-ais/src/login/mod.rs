//! Login state machine.
//!
//! One run walks `Idle → ChallengeFetched → CaptchaSolved → Submitted` and
//! ends `Authenticated` or `Fatal`; a `Retryable` outcome loops back to `Idle`
//! for another full cycle. Cycles are bounded by [`LoginConfig::max_cycles`].

mod classify;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::captcha::{CaptchaDecoder, CaptchaError, CaptchaResolver};
use crate::config::{LoginConfig, MarkerConfig};
use crate::error::{LoginError, PortalError, VaultError};
use crate::html;
use crate::portal::{AisPortal, LoginForm, LoginResponse};
use crate::session::Authenticator;
use crate::vault::CredentialVault;

pub use classify::{LoginOutcome, classify_login_response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    ChallengeFetched,
    CaptchaSolved,
    Submitted,
    Authenticated,
    Retryable,
    Fatal,
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ChallengeFetched => "challenge_fetched",
            Self::CaptchaSolved => "captcha_solved",
            Self::Submitted => "submitted",
            Self::Authenticated => "authenticated",
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Result of a successful login run.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginReport {
    pub identifier: String,
    pub token: String,
    /// Full cycles used, starting at 1.
    pub try_count: u32,
    /// CAPTCHA decode attempts across all cycles.
    pub captcha_attempts: u32,
}

impl fmt::Debug for LoginReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginReport")
            .field("identifier", &self.identifier)
            .field("try_count", &self.try_count)
            .field("captcha_attempts", &self.captcha_attempts)
            .finish_non_exhaustive()
    }
}

pub struct LoginMachine {
    portal: Arc<dyn AisPortal>,
    vault: Arc<CredentialVault>,
    decoder: Arc<dyn CaptchaDecoder>,
    resolver: CaptchaResolver,
    config: LoginConfig,
    markers: MarkerConfig,
}

impl LoginMachine {
    pub fn new(
        portal: Arc<dyn AisPortal>,
        vault: Arc<CredentialVault>,
        decoder: Arc<dyn CaptchaDecoder>,
        resolver: CaptchaResolver,
        config: LoginConfig,
        markers: MarkerConfig,
    ) -> Self {
        Self {
            portal,
            vault,
            decoder,
            resolver,
            config,
            markers,
        }
    }

    fn transition(&self, cycle: u32, from: LoginState, to: LoginState) {
        debug!(cycle, %from, %to, "Login state transition");
    }

    /// Identifier of the stored credential, without decrypting it.
    async fn stored_identifier(&self) -> Result<String, LoginError> {
        match self.vault.load().await {
            Ok(Some(credential)) => Ok(credential.identifier),
            Ok(None) => Err(LoginError::NoCredentials),
            // unlock_stored clears a corrupt entry and reports it
            Err(VaultError::Json(_)) => match self.vault.unlock_stored().await {
                Ok(Some(unlocked)) => Ok(unlocked.identifier),
                Ok(None) => Err(LoginError::NoCredentials),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Run one login to completion.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<LoginReport, LoginError> {
        let mut identifier = self.stored_identifier().await?;
        let max_cycles = self.config.max_cycles.max(1);
        let mut captcha_attempts = 0u32;
        let mut unknown_retries = 0u32;

        for try_count in 1..=max_cycles {
            let last_cycle = try_count == max_cycles;

            let portal = &self.portal;
            let solved = self
                .resolver
                .solve(
                    || async move {
                        let challenge = portal.fetch_challenge().await?;
                        debug!(cycle = try_count, to = %LoginState::ChallengeFetched, "Login state transition");
                        Ok::<_, PortalError>(challenge)
                    },
                    self.decoder.as_ref(),
                    cancel,
                )
                .await;

            let solved = match solved {
                Ok(solved) => solved,
                Err(CaptchaError::Unsolvable { attempts }) => {
                    captcha_attempts += attempts;
                    self.transition(try_count, LoginState::Idle, LoginState::Fatal);
                    return Err(LoginError::CaptchaUnsolvable {
                        attempts: captcha_attempts,
                    });
                }
                Err(CaptchaError::Fetch(e)) => {
                    self.transition(try_count, LoginState::Idle, LoginState::Fatal);
                    return Err(e.into());
                }
                Err(CaptchaError::Cancelled) => return Err(LoginError::Cancelled),
            };
            captcha_attempts += solved.attempts;
            self.transition(
                try_count,
                LoginState::ChallengeFetched,
                LoginState::CaptchaSolved,
            );

            let (submitted, response) = self
                .submit(&identifier, solved.answer, solved.challenge_ref, cancel)
                .await?;
            identifier = submitted;
            self.transition(try_count, LoginState::CaptchaSolved, LoginState::Submitted);

            match classify_login_response(&response, &self.markers) {
                LoginOutcome::Success(token) => {
                    self.transition(try_count, LoginState::Submitted, LoginState::Authenticated);
                    info!(try_count, captcha_attempts, "Logged in");
                    return Ok(LoginReport {
                        identifier,
                        token,
                        try_count,
                        captcha_attempts,
                    });
                }
                LoginOutcome::IncorrectCredentials => {
                    self.transition(try_count, LoginState::Submitted, LoginState::Fatal);
                    return Err(LoginError::IncorrectCredentials);
                }
                LoginOutcome::WrongCaptcha => {
                    debug!(try_count, "Captcha rejected by server");
                    if last_cycle {
                        self.transition(try_count, LoginState::Submitted, LoginState::Fatal);
                        return Err(LoginError::CaptchaUnsolvable {
                            attempts: captcha_attempts,
                        });
                    }
                }
                LoginOutcome::MissingToken => {
                    warn!(
                        try_count,
                        location = ?response.location,
                        excerpt = %html::excerpt(&response.body, 200),
                        "Login looked successful but carried no session token"
                    );
                    if last_cycle {
                        self.transition(try_count, LoginState::Submitted, LoginState::Fatal);
                        return Err(unknown(&response, "success response without session token"));
                    }
                }
                LoginOutcome::Unknown => {
                    warn!(
                        try_count,
                        status = %response.status,
                        excerpt = %html::excerpt(&response.body, 200),
                        "Unrecognised login response"
                    );
                    if last_cycle || unknown_retries >= self.config.max_unknown_retries {
                        self.transition(try_count, LoginState::Submitted, LoginState::Fatal);
                        return Err(unknown(&response, "unrecognised login response"));
                    }
                    unknown_retries += 1;
                }
            }

            self.transition(try_count, LoginState::Submitted, LoginState::Retryable);
            self.transition(try_count, LoginState::Retryable, LoginState::Idle);
        }

        // The last cycle always returns from the match above.
        Err(LoginError::UnknownLoginError {
            reason: "login cycles exhausted".to_string(),
        })
    }

    /// Decrypt the secret and submit the form. The plaintext lives only for
    /// the duration of this call.
    ///
    /// Returns the account actually submitted, which differs from `expected`
    /// when the credential was replaced mid-login.
    async fn submit(
        &self,
        expected: &str,
        captcha: String,
        challenge_ref: String,
        cancel: &CancellationToken,
    ) -> Result<(String, LoginResponse), LoginError> {
        let unlocked = self
            .vault
            .unlock_stored()
            .await?
            .ok_or(LoginError::NoCredentials)?;
        if unlocked.identifier != expected {
            info!("Stored credential changed during login, submitting the new account");
        }

        let account = unlocked.identifier.clone();
        let form = LoginForm {
            account: unlocked.identifier,
            password: unlocked.secret,
            captcha,
            challenge_ref,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(LoginError::Cancelled),
            response = self.portal.submit_login(form) => Ok((account, response?)),
        }
    }
}

fn unknown(response: &LoginResponse, reason: &str) -> LoginError {
    LoginError::UnknownLoginError {
        reason: format!("{reason} (HTTP {})", response.status.as_u16()),
    }
}

#[async_trait]
impl Authenticator for LoginMachine {
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<LoginReport, LoginError> {
        self.run(cancel).await
    }
}
