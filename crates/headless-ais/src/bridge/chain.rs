//! Declarative exchange chains.
//!
//! A chain is a list of hops, each a request template plus an extractor that
//! pulls the next credential out of the response. One engine interprets every
//! chain, so supporting another secondary system is a configuration change.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, LOCATION, SET_COOKIE};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{DownstreamKind, SecondarySystem};
use crate::config::BridgeConfig;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// Request of one hop. Every string may contain `{placeholder}`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub form: Vec<(String, String)>,
}

/// A rendered request, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub form: Vec<(String, String)>,
}

impl RequestTemplate {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            form: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn form(mut self, key: &str, value: &str) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    pub fn render(&self, vars: &HashMap<&str, &str>) -> Result<RenderedRequest, String> {
        let mut url = Url::parse(&substitute(&self.url, vars)?)
            .map_err(|e| format!("invalid url template {}: {e}", self.url))?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.query {
                pairs.append_pair(k, &substitute(v, vars)?);
            }
        }
        let form = self
            .form
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, vars)?)))
            .collect::<Result<Vec<_>, String>>()?;

        Ok(RenderedRequest {
            method: self.method,
            url,
            form,
        })
    }
}

/// Replace every `{name}` in `template`; unknown names are an error.
fn substitute(template: &str, vars: &HashMap<&str, &str>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = vars
            .get(name.as_str())
            .ok_or_else(|| format!("no value for {{{}}}", name.as_str()))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// How to pull a credential out of a hop's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Extractor {
    /// Query parameter of the `Location` redirect target.
    RedirectQuery { param: String },
    /// Value of a `Set-Cookie` header.
    SetCookie { name: String },
    /// JSON pointer into the body, with an optional pointer to a lifetime in
    /// seconds.
    JsonField {
        pointer: String,
        #[serde(default)]
        expires_in: Option<String>,
    },
    /// First capture group (or whole match) of a regex over the body.
    Pattern { regex: String },
}

/// Extracted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Extractor {
    pub fn needs_body(&self) -> bool {
        matches!(self, Self::JsonField { .. } | Self::Pattern { .. })
    }

    /// Extract from headers alone. Only for the header-based extractors.
    pub fn from_headers(&self, request_url: &Url, headers: &HeaderMap) -> Result<Extracted, String> {
        match self {
            Self::RedirectQuery { param } => {
                let location = headers
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| "response carried no redirect".to_string())?;
                let target = request_url
                    .join(location)
                    .map_err(|e| format!("bad redirect {location}: {e}"))?;
                target
                    .query_pairs()
                    .find(|(k, _)| k == param.as_str())
                    .map(|(_, v)| Extracted {
                        value: v.into_owned(),
                        expires_at: None,
                    })
                    .ok_or_else(|| format!("redirect has no {param} parameter"))
            }
            Self::SetCookie { name } => parse_set_cookies(headers)
                .remove(name)
                .filter(|v| !v.is_empty())
                .map(|value| Extracted {
                    value,
                    expires_at: None,
                })
                .ok_or_else(|| format!("no {name} cookie set")),
            Self::JsonField { .. } | Self::Pattern { .. } => {
                Err("extractor needs the response body".to_string())
            }
        }
    }

    pub fn from_body(&self, body: &str) -> Result<Extracted, String> {
        match self {
            Self::JsonField {
                pointer,
                expires_in,
            } => {
                let json: serde_json::Value =
                    serde_json::from_str(body).map_err(|e| format!("body is not JSON: {e}"))?;
                let value = match json.pointer(pointer) {
                    Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
                    Some(serde_json::Value::Number(n)) => n.to_string(),
                    _ => return Err(format!("no value at {pointer}")),
                };
                let expires_at = expires_in
                    .as_deref()
                    .and_then(|p| json.pointer(p))
                    .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
                Ok(Extracted { value, expires_at })
            }
            Self::Pattern { regex } => {
                let re = Regex::new(regex).map_err(|e| format!("invalid pattern: {e}"))?;
                let caps = re
                    .captures(body)
                    .ok_or_else(|| format!("pattern {regex} not found"))?;
                let value = caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                Ok(Extracted {
                    value,
                    expires_at: None,
                })
            }
            Self::RedirectQuery { .. } | Self::SetCookie { .. } => {
                Err("extractor reads headers, not the body".to_string())
            }
        }
    }
}

/// Cookies set by a response, `name -> value`.
pub fn parse_set_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();

    for value in headers.get_all(SET_COOKIE) {
        if let Ok(cookie_str) = value.to_str()
            && let Some(kv) = cookie_str.split(';').next()
            && let Some((name, value)) = kv.split_once('=')
        {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    cookies
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStep {
    pub kind: DownstreamKind,
    pub request: RequestTemplate,
    pub extractor: Extractor,
    /// Consumed by the next hop; never cached or reused.
    #[serde(default)]
    pub single_use: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeChain {
    pub system: SecondarySystem,
    pub steps: Vec<BridgeStep>,
}

impl BridgeChain {
    pub fn position(&self, kind: DownstreamKind) -> Option<usize> {
        self.steps.iter().position(|s| s.kind == kind)
    }

    /// Learning platform: CCXP OAuth code → access token → Moodle session.
    pub fn learning_platform() -> Self {
        Self {
            system: SecondarySystem::LearningPlatform,
            steps: vec![
                BridgeStep {
                    kind: DownstreamKind::SecondaryOAuthCode,
                    request: RequestTemplate::get("{ccxp_base}oauth/authorize.php")
                        .query("ACIXSTORE", "{acixstore}")
                        .query("client_id", "{elearn_client_id}")
                        .query("response_type", "code"),
                    extractor: Extractor::RedirectQuery {
                        param: "code".to_string(),
                    },
                    single_use: true,
                },
                BridgeStep {
                    kind: DownstreamKind::SecondaryAccessToken,
                    request: RequestTemplate::post("{elearn_base}auth/ccxp/token.php")
                        .form("grant_type", "authorization_code")
                        .form("client_id", "{elearn_client_id}")
                        .form("code", "{previous}"),
                    extractor: Extractor::JsonField {
                        pointer: "/access_token".to_string(),
                        expires_in: Some("/expires_in".to_string()),
                    },
                    single_use: false,
                },
                BridgeStep {
                    kind: DownstreamKind::SecondaryPlatformCookie,
                    request: RequestTemplate::get("{elearn_base}auth/ccxp/login.php")
                        .query("token", "{previous}"),
                    extractor: Extractor::SetCookie {
                        name: "MoodleSession".to_string(),
                    },
                    single_use: false,
                },
            ],
        }
    }

    /// Dormitory and parcel system: CCXP authorization code → PHP session.
    pub fn dormitory() -> Self {
        Self {
            system: SecondarySystem::Dormitory,
            steps: vec![
                BridgeStep {
                    kind: DownstreamKind::SecondaryOAuthCode,
                    request: RequestTemplate::get("{ccxp_base}oauth/authorize.php")
                        .query("ACIXSTORE", "{acixstore}")
                        .query("client_id", "{dorm_client_id}")
                        .query("response_type", "code"),
                    extractor: Extractor::RedirectQuery {
                        param: "code".to_string(),
                    },
                    single_use: true,
                },
                BridgeStep {
                    kind: DownstreamKind::SecondaryPlatformCookie,
                    request: RequestTemplate::get("{dorm_base}ccxp_login.php")
                        .query("code", "{previous}"),
                    extractor: Extractor::SetCookie {
                        name: "PHPSESSID".to_string(),
                    },
                    single_use: false,
                },
            ],
        }
    }
}

/// Chains from config, falling back to the built-in ones per system.
pub fn chains_from_config(config: &BridgeConfig) -> HashMap<SecondarySystem, BridgeChain> {
    let mut chains: HashMap<_, _> = [BridgeChain::learning_platform(), BridgeChain::dormitory()]
        .into_iter()
        .map(|c| (c.system, c))
        .collect();
    for chain in &config.chains {
        chains.insert(chain.system, chain.clone());
    }
    chains
}

/// Template variables derived from config.
pub fn base_vars(config: &BridgeConfig) -> HashMap<String, String> {
    HashMap::from([
        ("ccxp_base".to_string(), config.ccxp_base.clone()),
        ("elearn_base".to_string(), config.elearn_base.clone()),
        ("elearn_client_id".to_string(), config.elearn_client_id.clone()),
        ("dorm_base".to_string(), config.dorm_base.clone()),
        ("dorm_client_id".to_string(), config.dorm_client_id.clone()),
    ])
}
