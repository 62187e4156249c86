//! HTTP access to the Academic System.
//!
//! [`AisPortal`] is the seam between the login/session logic and the network.
//! [`HttpPortal`] talks to CCXP; tests substitute scripted portals.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use crate::captcha::CaptchaChallenge;
use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::html;

/// Fields of the CCXP login form.
pub struct LoginForm {
    pub account: String,
    pub password: String,
    pub captcha: String,
    pub challenge_ref: String,
}

impl fmt::Debug for LoginForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginForm")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("captcha", &self.captcha)
            .field("challenge_ref", &self.challenge_ref)
            .finish()
    }
}

/// Response to a login submission, body already Big5-decoded.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub status: StatusCode,
    pub location: Option<String>,
    pub body: String,
}

/// Raw response for an authenticated page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: StatusCode,
    pub location: Option<String>,
    pub body: Bytes,
}

#[async_trait]
pub trait AisPortal: Send + Sync {
    /// Load the login page and the CAPTCHA image it references.
    async fn fetch_challenge(&self) -> Result<CaptchaChallenge, PortalError>;

    async fn submit_login(&self, form: LoginForm) -> Result<LoginResponse, PortalError>;

    /// GET `path` with the session token and extra query parameters.
    async fn fetch_page(
        &self,
        path: &str,
        token: &str,
        params: &[(&str, &str)],
    ) -> Result<PageResponse, PortalError>;
}

/// Portal backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpPortal {
    client: Client,
    base: Url,
    config: PortalConfig,
}

impl HttpPortal {
    pub fn new(client: Client, config: PortalConfig) -> Result<Self, PortalError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| PortalError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Resolve `path` under the base URL, refusing anything that escapes it.
    fn url(&self, path: &str) -> Result<Url, PortalError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| PortalError::InvalidUrl(format!("{path}: {e}")))?;
        if url.origin() != self.base.origin() {
            return Err(PortalError::InvalidUrl(format!(
                "{path} resolves outside {}",
                self.base
            )));
        }
        Ok(url)
    }

    fn check_status(status: StatusCode, url: &Url) -> Result<(), PortalError> {
        if status.is_server_error() {
            return Err(PortalError::Unavailable {
                status,
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

fn location(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl AisPortal for HttpPortal {
    #[instrument(skip(self))]
    async fn fetch_challenge(&self) -> Result<CaptchaChallenge, PortalError> {
        let page_url = self.url(&self.config.login_page)?;
        let response = self.client.get(page_url.clone()).send().await?;
        Self::check_status(response.status(), &page_url)?;
        let page = html::decode_big5(&response.bytes().await?);

        let challenge_ref = html::extract_pwdstr(&page).ok_or_else(|| {
            PortalError::parse(
                page_url.as_str(),
                format!("no captcha reference in {}", html::excerpt(&page, 160)),
            )
        })?;

        let mut asset_url = self.url(&self.config.captcha_path)?;
        asset_url
            .query_pairs_mut()
            .append_pair("pwdstr", &challenge_ref);
        let response = self.client.get(asset_url.clone()).send().await?;
        let status = response.status();
        Self::check_status(status, &asset_url)?;
        if !status.is_success() {
            return Err(PortalError::parse(
                asset_url.as_str(),
                format!("captcha asset returned HTTP {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let asset = response.bytes().await?;
        debug!(challenge_ref = %challenge_ref, size = asset.len(), "Fetched captcha");

        Ok(CaptchaChallenge::new(challenge_ref, asset).with_content_type(content_type))
    }

    #[instrument(skip(self, form), fields(account = %form.account))]
    async fn submit_login(&self, form: LoginForm) -> Result<LoginResponse, PortalError> {
        let url = self.url(&self.config.login_path)?;
        let fields = [
            ("account", form.account.as_str()),
            ("passwd", form.password.as_str()),
            ("passwd2", form.captcha.as_str()),
            ("Submit", "登入"),
            ("fnstr", form.challenge_ref.as_str()),
        ];
        let response = self.client.post(url.clone()).form(&fields).send().await?;
        drop(form);

        let status = response.status();
        Self::check_status(status, &url)?;
        let location = location(&response);
        let body = html::decode_big5(&response.bytes().await?);
        debug!(%status, has_location = location.is_some(), "Login submitted");

        Ok(LoginResponse {
            status,
            location,
            body,
        })
    }

    #[instrument(skip(self, token, params))]
    async fn fetch_page(
        &self,
        path: &str,
        token: &str,
        params: &[(&str, &str)],
    ) -> Result<PageResponse, PortalError> {
        let mut url = self.url(path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.config.token_param, token);
            for (k, v) in params {
                query.append_pair(k, v);
            }
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        Self::check_status(status, &url)?;
        let location = location(&response);
        let body = response.bytes().await?;

        Ok(PageResponse {
            status,
            location,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn big5(text: &str) -> Vec<u8> {
        encoding_rs::BIG5.encode(text).0.into_owned()
    }

    async fn portal(server: &MockServer) -> HttpPortal {
        let config = PortalConfig {
            base_url: format!("{}/ccxp/INQUIRE/", server.uri()),
            ..PortalConfig::default()
        };
        HttpPortal::new(Client::new(), config).unwrap()
    }

    #[tokio::test]
    async fn fetch_challenge_follows_login_page_reference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ccxp/INQUIRE/index.php"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(big5(
                r#"<form>帳號 <img src="auth_img.php?pwdstr=20261019-42"></form>"#,
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ccxp/INQUIRE/auth_img.php"))
            .and(query_param("pwdstr", "20261019-42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"PNG".to_vec()),
            )
            .mount(&server)
            .await;

        let challenge = portal(&server).await.fetch_challenge().await.unwrap();
        assert_eq!(challenge.challenge_ref, "20261019-42");
        assert_eq!(challenge.asset.as_ref(), b"PNG");
        assert_eq!(challenge.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn missing_reference_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = portal(&server).await.fetch_challenge().await.unwrap_err();
        assert!(matches!(err, PortalError::Parse { .. }));
    }

    #[tokio::test]
    async fn submit_login_posts_form_and_keeps_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ccxp/INQUIRE/pre_select_entry.php"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "location",
                "select_entry.php?ACIXSTORE=tok123&hint=110000000",
            ))
            .mount(&server)
            .await;

        let response = portal(&server)
            .await
            .submit_login(LoginForm {
                account: "110000000".into(),
                password: "hunter2".into(),
                captcha: "123456".into(),
                challenge_ref: "ref-9".into(),
            })
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(
            response.location.as_deref(),
            Some("select_entry.php?ACIXSTORE=tok123&hint=110000000")
        );

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(body.contains("account=110000000"));
        assert!(body.contains("passwd=hunter2"));
        assert!(body.contains("passwd2=123456"));
        assert!(body.contains("fnstr=ref-9"));
    }

    #[tokio::test]
    async fn fetch_page_appends_token_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ccxp/INQUIRE/JH/6/JH629001.php"))
            .and(query_param("ACIXSTORE", "tok123"))
            .and(query_param("semester", "11410"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(big5("成績")))
            .mount(&server)
            .await;

        let page = portal(&server)
            .await
            .fetch_page("JH/6/JH629001.php", "tok123", &[("semester", "11410")])
            .await
            .unwrap();
        assert_eq!(html::decode_big5(&page.body), "成績");
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = portal(&server)
            .await
            .fetch_page("x.php", "tok", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Unavailable { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn paths_cannot_escape_base() {
        let server = MockServer::start().await;
        let err = portal(&server)
            .await
            .fetch_page("https://evil.example/steal", "tok", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::InvalidUrl(_)));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    type PageHandler =
        Box<dyn FnMut(&str, &str) -> Result<PageResponse, PortalError> + Send + 'static>;

    /// Portal replaying scripted login responses and serving pages from a
    /// handler keyed by `(path, token)`.
    pub struct ScriptedPortal {
        logins: Mutex<VecDeque<LoginResponse>>,
        pages: Mutex<PageHandler>,
        pub challenges: AtomicU32,
        pub submissions: Mutex<Vec<String>>,
        pub page_requests: AtomicU32,
    }

    impl ScriptedPortal {
        pub fn new() -> Self {
            Self {
                logins: Mutex::new(VecDeque::new()),
                pages: Mutex::new(Box::new(|_, _| {
                    Err(PortalError::parse("page", "no page handler"))
                })),
                challenges: AtomicU32::new(0),
                submissions: Mutex::new(Vec::new()),
                page_requests: AtomicU32::new(0),
            }
        }

        pub fn with_logins(self, responses: impl IntoIterator<Item = LoginResponse>) -> Self {
            self.logins.lock().extend(responses);
            self
        }

        pub fn with_pages<F>(self, handler: F) -> Self
        where
            F: FnMut(&str, &str) -> Result<PageResponse, PortalError> + Send + 'static,
        {
            *self.pages.lock() = Box::new(handler);
            self
        }

        pub fn challenges(&self) -> u32 {
            self.challenges.load(Ordering::SeqCst)
        }

        pub fn submissions(&self) -> usize {
            self.submissions.lock().len()
        }
    }

    pub fn redirect_to(location: &str) -> LoginResponse {
        LoginResponse {
            status: StatusCode::FOUND,
            location: Some(location.to_string()),
            body: String::new(),
        }
    }

    pub fn login_page(body: &str) -> LoginResponse {
        LoginResponse {
            status: StatusCode::OK,
            location: None,
            body: body.to_string(),
        }
    }

    pub fn success(token: &str) -> LoginResponse {
        redirect_to(&format!("select_entry.php?ACIXSTORE={token}&hint=110000000"))
    }

    pub fn page(status: u16, body: &str) -> PageResponse {
        PageResponse {
            status: StatusCode::from_u16(status).unwrap(),
            location: None,
            body: Bytes::from(encoding_rs::BIG5.encode(body).0.into_owned()),
        }
    }

    #[async_trait]
    impl AisPortal for ScriptedPortal {
        async fn fetch_challenge(&self) -> Result<CaptchaChallenge, PortalError> {
            let n = self.challenges.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CaptchaChallenge::new(
                format!("pwd-{n}"),
                Bytes::from_static(b"GIF89a"),
            ))
        }

        async fn submit_login(&self, form: LoginForm) -> Result<LoginResponse, PortalError> {
            self.submissions.lock().push(form.password.clone());
            self.logins
                .lock()
                .pop_front()
                .ok_or_else(|| PortalError::parse("login", "no scripted response left"))
        }

        async fn fetch_page(
            &self,
            path: &str,
            token: &str,
            _params: &[(&str, &str)],
        ) -> Result<PageResponse, PortalError> {
            self.page_requests.fetch_add(1, Ordering::SeqCst);
            let mut handler = self.pages.lock();
            (*handler)(path, token)
        }
    }
}
