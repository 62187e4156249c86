use reqwest::StatusCode;
use thiserror::Error;

use crate::bridge::{DownstreamKind, SecondarySystem};

/// Errors raised by the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Ciphertext, IV or key do not produce a valid plaintext.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The device-local key could not be loaded.
    #[error("vault key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("vault storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VaultError {
    /// Whether the stored credential can never be decrypted again.
    ///
    /// Callers must not retry the same ciphertext when this returns `true`.
    pub fn is_unusable(&self) -> bool {
        matches!(self, Self::Decryption(_) | Self::KeyUnavailable(_))
    }
}

/// Transport-level failures talking to the Academic System.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("http error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("academic system returned HTTP {status} for {url}")]
    Unavailable { status: StatusCode, url: String },

    #[error("unexpected response from {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl PortalError {
    pub fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Fatal outcomes of a login run.
///
/// This type is cloned to every caller waiting on the same in-flight login,
/// so transport errors are carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("incorrect account or password")]
    IncorrectCredentials,

    #[error("captcha could not be solved after {attempts} attempts")]
    CaptchaUnsolvable { attempts: u32 },

    #[error("unrecognised login response: {reason}")]
    UnknownLoginError { reason: String },

    #[error("stored credentials are unusable: {0}")]
    Decryption(String),

    #[error("no stored credentials")]
    NoCredentials,

    /// The vault could not be read or written; the credential itself may be fine.
    #[error("credential store unavailable: {0}")]
    VaultUnavailable(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("academic system unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("login cancelled")]
    Cancelled,
}

impl LoginError {
    /// Whether the user has to enter their account and password again.
    pub fn requires_reentry(&self) -> bool {
        matches!(
            self,
            Self::IncorrectCredentials | Self::Decryption(_) | Self::NoCredentials
        )
    }

    /// Whether a later attempt may succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure(_)
                | Self::UpstreamUnavailable(_)
                | Self::CaptchaUnsolvable { .. }
                | Self::VaultUnavailable(_)
        )
    }

    /// A single human-readable line separating "wrong login" from
    /// "the system is having trouble".
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::IncorrectCredentials => "Wrong account or password, please sign in again.",
            Self::Decryption(_) | Self::NoCredentials => {
                "Saved sign-in is no longer usable, please sign in again."
            }
            Self::Cancelled => "Sign-in was cancelled.",
            Self::VaultUnavailable(_) => "Saved sign-in could not be read, please try again.",
            Self::CaptchaUnsolvable { .. }
            | Self::UnknownLoginError { .. }
            | Self::NetworkFailure(_)
            | Self::UpstreamUnavailable(_) => {
                "The academic system is having trouble right now, please try again later."
            }
        }
    }
}

impl From<PortalError> for LoginError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::Network(e) => LoginError::NetworkFailure(e.to_string()),
            PortalError::Unavailable { .. } => LoginError::UpstreamUnavailable(err.to_string()),
            PortalError::Parse { .. } | PortalError::InvalidUrl(_) => {
                LoginError::UnknownLoginError {
                    reason: err.to_string(),
                }
            }
        }
    }
}

impl From<VaultError> for LoginError {
    fn from(err: VaultError) -> Self {
        if err.is_unusable() {
            LoginError::Decryption(err.to_string())
        } else {
            LoginError::VaultUnavailable(err.to_string())
        }
    }
}

/// Errors handed to data adapters by the request gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The token was rejected twice in a row.
    #[error("session expired")]
    SessionExpired,

    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// `maintenance` is set when CCXP served its maintenance notice rather
    /// than failing outright.
    #[error("academic system unavailable ({}): {reason}", fmt_status(.status))]
    UpstreamUnavailable {
        status: Option<u16>,
        reason: String,
        maintenance: bool,
    },

    #[error("login failed: {0}")]
    Login(#[from] LoginError),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("request cancelled")]
    Cancelled,
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "no status".to_string(),
    }
}

impl GatewayError {
    pub fn upstream(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            status,
            reason: reason.into(),
            maintenance: false,
        }
    }

    pub fn maintenance(status: Option<u16>) -> Self {
        Self::UpstreamUnavailable {
            status,
            reason: "under maintenance".to_string(),
            maintenance: true,
        }
    }

    /// Whether the caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkFailure(_) | Self::UpstreamUnavailable { .. } => true,
            Self::Login(e) => matches!(
                e,
                LoginError::NetworkFailure(_)
                    | LoginError::UpstreamUnavailable(_)
                    | LoginError::VaultUnavailable(_)
            ),
            Self::SessionExpired | Self::InvalidPath(_) | Self::Cancelled => false,
        }
    }
}

impl From<PortalError> for GatewayError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::Network(e) => GatewayError::NetworkFailure(e.to_string()),
            PortalError::Unavailable { status, .. } => {
                GatewayError::upstream(Some(status.as_u16()), err.to_string())
            }
            PortalError::Parse { .. } => GatewayError::upstream(None, err.to_string()),
            PortalError::InvalidUrl(path) => GatewayError::InvalidPath(path),
        }
    }
}

/// Failures of a secondary-system token exchange.
///
/// These never invalidate the primary session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{system} hop {step} ({kind}) failed: {reason}")]
    Hop {
        system: SecondarySystem,
        kind: DownstreamKind,
        step: usize,
        reason: String,
    },

    #[error("{system} hop {step} ({kind}) network failure: {source}")]
    Network {
        system: SecondarySystem,
        kind: DownstreamKind,
        step: usize,
        #[source]
        source: reqwest::Error,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error("no chain produces {kind} for {system}")]
    UnknownChain {
        system: SecondarySystem,
        kind: DownstreamKind,
    },

    #[error("primary session unavailable: {0}")]
    Session(#[from] GatewayError),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_require_reentry() {
        assert!(LoginError::IncorrectCredentials.requires_reentry());
        assert!(LoginError::Decryption("bad padding".into()).requires_reentry());
        assert!(!LoginError::CaptchaUnsolvable { attempts: 6 }.requires_reentry());
        assert!(!LoginError::NetworkFailure("reset".into()).requires_reentry());
    }

    #[test]
    fn only_unusable_vault_errors_require_reentry() {
        let bad_key = LoginError::from(VaultError::KeyUnavailable("missing".into()));
        assert!(matches!(bad_key, LoginError::Decryption(_)));
        assert!(bad_key.requires_reentry());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy");
        let read_failure = LoginError::from(VaultError::Io(io));
        assert!(matches!(read_failure, LoginError::VaultUnavailable(_)));
        assert!(!read_failure.requires_reentry());
        assert!(read_failure.is_transient());
        assert_ne!(
            read_failure.user_message(),
            LoginError::NoCredentials.user_message()
        );

        let storage = LoginError::from(VaultError::Storage("disk full".into()));
        assert!(!storage.requires_reentry());
    }

    #[test]
    fn user_message_separates_wrong_login_from_outage() {
        let wrong = LoginError::IncorrectCredentials.user_message();
        let outage = LoginError::UnknownLoginError {
            reason: "drift".into(),
        }
        .user_message();
        assert_ne!(wrong, outage);
        assert_eq!(
            outage,
            LoginError::CaptchaUnsolvable { attempts: 6 }.user_message()
        );
    }

    #[test]
    fn gateway_retryability() {
        assert!(GatewayError::NetworkFailure("timeout".into()).is_retryable());
        assert!(GatewayError::upstream(Some(503), "maintenance").is_retryable());
        assert!(!GatewayError::SessionExpired.is_retryable());
        assert!(!GatewayError::Login(LoginError::IncorrectCredentials).is_retryable());
    }

    #[test]
    fn vault_decryption_is_unusable() {
        assert!(VaultError::Decryption("x".into()).is_unusable());
        assert!(VaultError::KeyUnavailable("x".into()).is_unusable());
        assert!(!VaultError::Storage("x".into()).is_unusable());
    }
}
