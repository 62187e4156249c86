//! Configuration for the authentication proxy.
//!
//! Every section deserializes with `#[serde(default)]`, so a partial TOML file
//! only overrides what it names. Defaults target NTHU's CCXP INQUIRE portal.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::BridgeChain;
use crate::captcha::CaptchaShape;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

pub const DEFAULT_BASE_URL: &str = "https://www.ccxp.nthu.edu.tw/ccxp/INQUIRE/";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AisConfig {
    pub portal: PortalConfig,
    pub login: LoginConfig,
    pub http: HttpConfig,
    pub ocr: OcrConfig,
    pub bridge: BridgeConfig,
    pub vault: VaultConfig,
}

/// Academic System endpoints and the HTML markers used to classify its pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Base URL, must end with `/` so relative paths join beneath it.
    pub base_url: String,
    /// Page carrying the login form and the CAPTCHA reference.
    pub login_page: String,
    /// CAPTCHA image endpoint, keyed by the `pwdstr` query parameter.
    pub captcha_path: String,
    /// Login form target.
    pub login_path: String,
    /// Query parameter carrying the session token on content pages.
    pub token_param: String,
    pub captcha_shape: CaptchaShape,
    pub markers: MarkerConfig,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_page: "index.php".to_string(),
            captcha_path: "auth_img.php".to_string(),
            login_path: "pre_select_entry.php".to_string(),
            token_param: "ACIXSTORE".to_string(),
            captcha_shape: CaptchaShape::Numeric { len: 6 },
            markers: MarkerConfig::default(),
        }
    }
}

/// Free-text markers the Academic System embeds instead of status codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub wrong_captcha: Vec<String>,
    pub incorrect_credentials: Vec<String>,
    /// Present on a successful login response even when the token is missing.
    pub login_success: Vec<String>,
    /// Content pages that mean the token was rejected.
    pub session_expired: Vec<String>,
    /// Content pages that mean the system is down for maintenance.
    pub maintenance: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            wrong_captcha: vec!["驗證碼輸入錯誤".to_string(), "Wrong check code".to_string()],
            incorrect_credentials: vec![
                "帳號或密碼錯誤".to_string(),
                "密碼錯誤".to_string(),
                "帳號不存在".to_string(),
                "Incorrect account or password".to_string(),
            ],
            login_success: vec!["select_entry.php".to_string()],
            session_expired: vec![
                "session is interrupted".to_string(),
                "Session is interrupted".to_string(),
                "請重新登入".to_string(),
                "auth_img.php".to_string(),
            ],
            maintenance: vec!["系統維護".to_string(), "under maintenance".to_string()],
        }
    }
}

/// Retry bounds of the login state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Full challenge → submit cycles per login.
    pub max_cycles: u32,
    /// CAPTCHA decode attempts inside one cycle.
    pub max_captcha_attempts: u32,
    /// Extra cycles granted to an unrecognised response.
    pub max_unknown_retries: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            max_captcha_attempts: 6,
            max_unknown_retries: 1,
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// Whole-request timeout in seconds, `0` disables it.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Remote OCR service used to read CAPTCHA images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub endpoint: Option<String>,
}

/// Secondary-system exchange chains and the values substituted into them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub ccxp_base: String,
    pub elearn_base: String,
    pub elearn_client_id: String,
    pub dorm_base: String,
    pub dorm_client_id: String,
    /// Replace the built-in chain of the same system.
    pub chains: Vec<BridgeChain>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ccxp_base: DEFAULT_BASE_URL.to_string(),
            elearn_base: "https://elearn.nthu.edu.tw/".to_string(),
            elearn_client_id: "elearn".to_string(),
            dorm_base: "https://dorm.nthu.edu.tw/".to_string(),
            dorm_client_id: "dorm".to_string(),
            chains: Vec::new(),
        }
    }
}

/// Where the device keeps the encrypted credential and its key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub credential_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: AisConfig = serde_json::from_str(
            r#"{"portal": {"base_url": "http://localhost:8080/ccxp/"}, "login": {"max_cycles": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.portal.base_url, "http://localhost:8080/ccxp/");
        assert_eq!(config.portal.login_path, "pre_select_entry.php");
        assert_eq!(config.login.max_cycles, 5);
        assert_eq!(config.login.max_captcha_attempts, 6);
        assert_eq!(config.portal.captcha_shape, CaptchaShape::Numeric { len: 6 });
    }

    #[test]
    fn captcha_shape_is_tagged() {
        let config: PortalConfig =
            serde_json::from_str(r#"{"captcha_shape": {"kind": "alphanumeric", "len": 4}}"#)
                .unwrap();
        assert_eq!(config.captcha_shape, CaptchaShape::Alphanumeric { len: 4 });
    }
}
