use crate::config::MarkerConfig;
use crate::html;
use crate::portal::LoginResponse;

/// What a login submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success(String),
    /// Looked like a success but carried no session token.
    MissingToken,
    WrongCaptcha,
    IncorrectCredentials,
    Unknown,
}

/// Classify a login response.
///
/// Error markers win over success hints: a rejected login page still links
/// back to the entry page on some portal versions.
pub fn classify_login_response(response: &LoginResponse, markers: &MarkerConfig) -> LoginOutcome {
    let body = response.body.as_str();

    if html::contains_any(body, &markers.wrong_captcha) {
        return LoginOutcome::WrongCaptcha;
    }
    if html::contains_any(body, &markers.incorrect_credentials) {
        return LoginOutcome::IncorrectCredentials;
    }

    let token = response
        .location
        .as_deref()
        .and_then(html::extract_acixstore)
        .or_else(|| html::extract_acixstore(body));
    if let Some(token) = token {
        return LoginOutcome::Success(token);
    }

    let looks_successful = response.status.is_redirection()
        || response
            .location
            .as_deref()
            .is_some_and(|l| html::contains_any(l, &markers.login_success))
        || html::contains_any(body, &markers.login_success);
    if looks_successful {
        return LoginOutcome::MissingToken;
    }

    LoginOutcome::Unknown
}
