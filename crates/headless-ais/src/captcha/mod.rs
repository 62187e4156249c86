//! CAPTCHA resolution.
//!
//! Every decode attempt uses a brand-new challenge: a CCXP challenge is bound
//! to its `pwdstr` and cannot be reused after a wrong answer.

mod decoder;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PortalError;

pub use decoder::RemoteOcrDecoder;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Expected shape of a decoded answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptchaShape {
    /// Fixed number of ASCII digits.
    Numeric { len: usize },
    /// Fixed number of ASCII letters or digits.
    Alphanumeric { len: usize },
}

impl CaptchaShape {
    /// Normalize a raw decode and check it against the shape.
    ///
    /// Whitespace is dropped; anything else out of shape rejects the decode.
    pub fn accept(&self, raw: &str) -> Option<String> {
        let answer: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let (len, ok) = match self {
            Self::Numeric { len } => (*len, answer.chars().all(|c| c.is_ascii_digit())),
            Self::Alphanumeric { len } => {
                (*len, answer.chars().all(|c| c.is_ascii_alphanumeric()))
            }
        };
        (ok && answer.len() == len).then_some(answer)
    }
}

/// One fetched challenge.
#[derive(Debug, Clone)]
pub struct CaptchaChallenge {
    /// Server-side reference (`pwdstr`) the answer is checked against.
    pub challenge_ref: String,
    pub asset: Bytes,
    pub content_type: Option<String>,
    /// 1-based attempt number inside the current solve.
    pub attempt: u32,
    pub decoded: Option<String>,
}

impl CaptchaChallenge {
    pub fn new(challenge_ref: impl Into<String>, asset: Bytes) -> Self {
        Self {
            challenge_ref: challenge_ref.into(),
            asset,
            content_type: None,
            attempt: 0,
            decoded: None,
        }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("ocr request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ocr service returned HTTP {0}")]
    Status(u16),

    #[error("decoder produced no answer")]
    Empty,

    #[error("{0}")]
    Other(String),
}

/// Turns a challenge image into text. Implementations may be remote.
#[async_trait]
pub trait CaptchaDecoder: Send + Sync {
    async fn decode(&self, challenge: &CaptchaChallenge) -> Result<String, DecodeError>;
}

/// Pre-processing applied to the raw asset before decoding.
pub trait AssetFilter: Send + Sync {
    fn apply(&self, asset: Bytes) -> Bytes;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityFilter;

impl AssetFilter for IdentityFilter {
    fn apply(&self, asset: Bytes) -> Bytes {
        asset
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolvedCaptcha {
    pub challenge_ref: String,
    pub answer: String,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha unsolvable after {attempts} attempts")]
    Unsolvable { attempts: u32 },

    #[error("failed to fetch challenge: {0}")]
    Fetch(#[from] PortalError),

    #[error("cancelled")]
    Cancelled,
}

/// Bounded fetch → decode → validate loop.
#[derive(Clone)]
pub struct CaptchaResolver {
    shape: CaptchaShape,
    max_attempts: u32,
    filter: Arc<dyn AssetFilter>,
}

impl CaptchaResolver {
    pub fn new(shape: CaptchaShape, max_attempts: u32) -> Self {
        Self {
            shape,
            max_attempts: max_attempts.max(1),
            filter: Arc::new(IdentityFilter),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn AssetFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn shape(&self) -> CaptchaShape {
        self.shape
    }

    /// Solve a challenge within `max_attempts` decodes.
    ///
    /// `fetch` is called once per attempt. A fetch error ends the loop and is
    /// surfaced as-is, it never counts as a decode attempt.
    pub async fn solve<F, Fut>(
        &self,
        mut fetch: F,
        decoder: &dyn CaptchaDecoder,
        cancel: &CancellationToken,
    ) -> Result<SolvedCaptcha, CaptchaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CaptchaChallenge, PortalError>>,
    {
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(CaptchaError::Cancelled);
            }

            let mut challenge = tokio::select! {
                _ = cancel.cancelled() => return Err(CaptchaError::Cancelled),
                fetched = fetch() => fetched?,
            };
            challenge.attempt = attempt;
            challenge.asset = self.filter.apply(challenge.asset);

            let decoded = tokio::select! {
                _ = cancel.cancelled() => return Err(CaptchaError::Cancelled),
                decoded = decoder.decode(&challenge) => decoded,
            };

            if let Ok(raw) = &decoded {
                challenge.decoded = Some(raw.clone());
            }
            match decoded {
                Ok(raw) => match self.shape.accept(&raw) {
                    Some(answer) => {
                        debug!(attempt, challenge_ref = %challenge.challenge_ref, "Captcha decoded");
                        return Ok(SolvedCaptcha {
                            challenge_ref: challenge.challenge_ref,
                            answer,
                            attempts: attempt,
                        });
                    }
                    None => {
                        debug!(attempt, raw = %raw, shape = ?self.shape, "Decode out of shape, refetching");
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "Captcha decoder failed, refetching");
                }
            }
        }

        Err(CaptchaError::Unsolvable {
            attempts: self.max_attempts,
        })
    }
}

impl Default for CaptchaResolver {
    fn default() -> Self {
        Self::new(CaptchaShape::Numeric { len: 6 }, DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Decoder replaying a fixed script, then repeating the last entry.
    pub struct ScriptedDecoder {
        script: Mutex<VecDeque<Result<String, String>>>,
        last: Mutex<Option<Result<String, String>>>,
        pub calls: std::sync::atomic::AtomicU32,
        /// Assets handed to the decoder, in order.
        pub assets: Mutex<Vec<Bytes>>,
    }

    impl ScriptedDecoder {
        pub fn new<I, S>(answers: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                script: Mutex::new(answers.into_iter().map(|a| Ok(a.into())).collect()),
                last: Mutex::new(None),
                calls: Default::default(),
                assets: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                script: Mutex::new(VecDeque::from([Err("ocr down".to_string())])),
                last: Mutex::new(None),
                calls: Default::default(),
                assets: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CaptchaDecoder for ScriptedDecoder {
        async fn decode(&self, challenge: &CaptchaChallenge) -> Result<String, DecodeError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.assets.lock().push(challenge.asset.clone());
            let next = self.script.lock().pop_front();
            let item = match next {
                Some(item) => {
                    *self.last.lock() = Some(item.clone());
                    item
                }
                None => self.last.lock().clone().unwrap_or(Err("empty script".into())),
            };
            item.map_err(DecodeError::Other)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::testing::ScriptedDecoder;
    use super::*;

    fn challenge_source(
        counter: &AtomicU32,
    ) -> impl FnMut() -> std::future::Ready<Result<CaptchaChallenge, PortalError>> + '_ {
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(Ok(CaptchaChallenge::new(
                format!("ref-{n}"),
                Bytes::from_static(b"GIF89a"),
            )))
        }
    }

    #[test]
    fn shape_accepts_and_normalizes() {
        let numeric = CaptchaShape::Numeric { len: 6 };
        assert_eq!(numeric.accept(" 123 456\n").as_deref(), Some("123456"));
        assert_eq!(numeric.accept("12345"), None);
        assert_eq!(numeric.accept("12345a"), None);

        let alnum = CaptchaShape::Alphanumeric { len: 4 };
        assert_eq!(alnum.accept("aB3x").as_deref(), Some("aB3x"));
        assert_eq!(alnum.accept("aB3!"), None);
    }

    #[tokio::test]
    async fn out_of_shape_decodes_refetch() {
        let fetched = AtomicU32::new(0);
        let decoder = ScriptedDecoder::new(["12", "abcdef", "654321"]);
        let resolver = CaptchaResolver::default();

        let solved = resolver
            .solve(challenge_source(&fetched), &decoder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(solved.answer, "654321");
        assert_eq!(solved.attempts, 3);
        assert_eq!(solved.challenge_ref, "ref-3");
        assert_eq!(fetched.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminates_within_bound() {
        let fetched = AtomicU32::new(0);
        let decoder = ScriptedDecoder::new(["nope"]);
        let resolver = CaptchaResolver::default();

        let err = resolver
            .solve(challenge_source(&fetched), &decoder, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptchaError::Unsolvable { attempts: 6 }));
        assert_eq!(decoder.calls(), 6);
        assert_eq!(fetched.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn decoder_failures_count_as_attempts() {
        let fetched = AtomicU32::new(0);
        let decoder = ScriptedDecoder::failing();
        let resolver = CaptchaResolver::new(CaptchaShape::Numeric { len: 6 }, 2);

        let err = resolver
            .solve(challenge_source(&fetched), &decoder, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Unsolvable { attempts: 2 }));
    }

    #[tokio::test]
    async fn fetch_failure_is_surfaced() {
        let decoder = ScriptedDecoder::new(["123456"]);
        let resolver = CaptchaResolver::default();

        let err = resolver
            .solve(
                || std::future::ready(Err(PortalError::parse("login page", "no pwdstr"))),
                &decoder,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CaptchaError::Fetch(_)));
        assert_eq!(decoder.calls(), 0);
    }

    /// Drops a fixed-size header, like stripping a GIF preamble.
    struct StripHeader(usize);

    impl AssetFilter for StripHeader {
        fn apply(&self, asset: Bytes) -> Bytes {
            asset.slice(self.0.min(asset.len())..)
        }
    }

    #[tokio::test]
    async fn decoder_sees_filtered_asset() {
        let fetched = AtomicU32::new(0);
        let decoder = ScriptedDecoder::new(["x", "123456"]);
        let resolver = CaptchaResolver::default().with_filter(Arc::new(StripHeader(3)));

        resolver
            .solve(challenge_source(&fetched), &decoder, &CancellationToken::new())
            .await
            .unwrap();

        let assets = decoder.assets.lock();
        assert_eq!(assets.len(), 2);
        assert!(assets.iter().all(|asset| asset.as_ref() == b"89a"));
    }

    #[tokio::test]
    async fn cancelled_before_first_fetch() {
        let fetched = AtomicU32::new(0);
        let decoder = ScriptedDecoder::new(["123456"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = CaptchaResolver::default()
            .solve(challenge_source(&fetched), &decoder, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Cancelled));
        assert_eq!(fetched.load(Ordering::SeqCst), 0);
    }
}
