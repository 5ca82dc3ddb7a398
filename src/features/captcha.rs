//! CAPTCHA resolution.
//!
//! The solving capability itself is external ([`CaptchaSolver`]). The
//! [`CaptchaResolver`] wrapper never fails: malformed images, solver errors and
//! implausible answers all collapse to a zero-confidence placeholder, and the
//! portal's own rejection message drives the retry loop.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::types::{CaptchaAnswer, CaptchaChallenge};

/// Submitted when nothing better is available.
pub const PLACEHOLDER_ANSWER: &str = "1234";

const MIN_ANSWER_LEN: usize = 4;
const MAX_ANSWER_LEN: usize = 8;

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    fn name(&self) -> &str;

    async fn solve(&self, image: &[u8]) -> Result<CaptchaAnswer>;
}

// ── Hosted solver ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SolveRequestBody<'a> {
    image: String,
    charset: &'a str,
}

#[derive(Deserialize)]
struct SolveResponseBody {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// POSTs the base64 image to an OCR endpoint and reads `{"text", "confidence"}`.
pub struct HttpCaptchaSolver {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: Option<String>,
}

impl HttpCaptchaSolver {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint).with_context(|| format!("invalid solver URL '{}'", endpoint))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build captcha solver client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl CaptchaSolver for HttpCaptchaSolver {
    fn name(&self) -> &str {
        "http"
    }

    async fn solve(&self, image: &[u8]) -> Result<CaptchaAnswer> {
        let body = SolveRequestBody {
            image: base64::engine::general_purpose::STANDARD.encode(image),
            charset: "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz",
        };
        let mut req = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("captcha solver request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("captcha solver returned HTTP {}", status));
        }
        let parsed: SolveResponseBody = resp.json().await.context("captcha solver sent invalid JSON")?;
        Ok(CaptchaAnswer {
            text: parsed.text,
            confidence: parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        })
    }
}

// ── Placeholder ──────────────────────────────────────────────────────────────

/// Always answers [`PLACEHOLDER_ANSWER`] with zero confidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderSolver;

#[async_trait]
impl CaptchaSolver for PlaceholderSolver {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn solve(&self, _image: &[u8]) -> Result<CaptchaAnswer> {
        Ok(placeholder())
    }
}

pub fn placeholder() -> CaptchaAnswer {
    CaptchaAnswer {
        text: PLACEHOLDER_ANSWER.to_string(),
        confidence: 0.0,
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Recognise PNG, JPEG and GIF by magic bytes.
pub fn looks_like_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF8")
}

/// Keep ASCII alphanumerics only; reject answers outside 4..=8 characters.
pub fn normalize_answer(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if (MIN_ANSWER_LEN..=MAX_ANSWER_LEN).contains(&cleaned.len()) {
        Some(cleaned)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct CaptchaResolver {
    solver: Arc<dyn CaptchaSolver>,
    timeout: Duration,
}

impl CaptchaResolver {
    pub fn new(solver: Arc<dyn CaptchaSolver>, timeout: Duration) -> Self {
        Self { solver, timeout }
    }

    /// Hosted solver when `captcha_solver_url` is configured, placeholder otherwise.
    pub fn from_config(cfg: &crate::core::PortalConfig) -> Self {
        let timeout = cfg.captcha_render_timeout();
        let solver: Arc<dyn CaptchaSolver> = match &cfg.captcha_solver_url {
            Some(url) => match HttpCaptchaSolver::new(url, cfg.captcha_solver_key.clone(), timeout) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    warn!("captcha: hosted solver unavailable ({:#}); using placeholder answers", e);
                    Arc::new(PlaceholderSolver)
                }
            },
            None => {
                info!("captcha: no solver endpoint configured; using placeholder answers");
                Arc::new(PlaceholderSolver)
            }
        };
        Self::new(solver, timeout)
    }

    /// Best-effort answer for one challenge. Never fails.
    pub async fn solve(&self, challenge: &CaptchaChallenge) -> CaptchaAnswer {
        if !looks_like_image(&challenge.image) {
            warn!(
                attempt = challenge.attempt,
                bytes = challenge.image.len(),
                "captcha: challenge image is malformed, submitting placeholder"
            );
            return placeholder();
        }

        let raw = match tokio::time::timeout(self.timeout, self.solver.solve(&challenge.image)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(attempt = challenge.attempt, solver = self.solver.name(), "captcha: solver failed: {:#}", e);
                return placeholder();
            }
            Err(_) => {
                warn!(attempt = challenge.attempt, solver = self.solver.name(), "captcha: solver timed out");
                return placeholder();
            }
        };

        match normalize_answer(&raw.text) {
            Some(text) => {
                info!(
                    attempt = challenge.attempt,
                    solver = self.solver.name(),
                    confidence = raw.confidence,
                    "captcha: proposed answer {}",
                    text
                );
                CaptchaAnswer {
                    text,
                    confidence: raw.confidence,
                }
            }
            None => {
                warn!(attempt = challenge.attempt, "captcha: implausible answer {:?}", raw.text);
                placeholder()
            }
        }
    }
}
