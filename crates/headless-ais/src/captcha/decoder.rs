use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

use super::{CaptchaChallenge, CaptchaDecoder, DecodeError};

/// Decoder backed by an OCR HTTP service.
///
/// The asset bytes are POSTed as-is; the service replies with the recognised
/// text as a plain body.
#[derive(Debug, Clone)]
pub struct RemoteOcrDecoder {
    client: Client,
    endpoint: Url,
}

impl RemoteOcrDecoder {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl CaptchaDecoder for RemoteOcrDecoder {
    async fn decode(&self, challenge: &CaptchaChallenge) -> Result<String, DecodeError> {
        let content_type = challenge
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, content_type)
            .body(challenge.asset.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DecodeError::Status(status.as_u16()));
        }

        let text = response.text().await?;
        let answer = text.trim();
        debug!(attempt = challenge.attempt, answer = %answer, "OCR replied");
        if answer.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(answer.to_string())
    }
}
