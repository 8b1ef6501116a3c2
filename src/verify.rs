//! Human-verification gate collaborator client.
//!
//! The gate consults an external hCaptcha-style `siteverify` endpoint once
//! per connection. The call is plain network I/O with its own failure mode:
//! the outcome is ternary — accepted, rejected, or collaborator error — and
//! only the connection that issued the check ever waits on it.

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

/// Result of a verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The collaborator accepted the token.
    Accepted,
    /// The collaborator rejected the token; the connection must be closed.
    Rejected,
    /// The collaborator was unreachable or returned garbage; the client
    /// may retry verification.
    CollaboratorError,
}

/// Response body of the `siteverify` endpoint.
#[derive(Deserialize)]
struct SiteverifyResponse {
    success: bool,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

/// Validates that the endpoint URL has an http(s) scheme and a host.
fn validate_endpoint_url(url: &str) -> anyhow::Result<()> {
    let parsed = url.parse::<reqwest::Url>()?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        anyhow::bail!("captcha URL scheme must be http or https, got: {}", scheme);
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("captcha URL must have a host");
    }
    Ok(())
}

enum Mode {
    /// No secret configured; any token passes. Used in development and in
    /// deployments where verification is fronted elsewhere.
    PassThrough,
    Captcha {
        http: Client,
        url: String,
        secret: String,
    },
}

/// Client for the external verification collaborator.
pub struct Verifier {
    mode: Mode,
}

impl Verifier {
    /// Creates a verifier. With no secret the gate runs in pass-through
    /// mode and accepts any token.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL is not a usable http(s) URL.
    pub fn new(url: &str, secret: Option<String>) -> anyhow::Result<Self> {
        let mode = match secret {
            Some(secret) if !secret.is_empty() => {
                validate_endpoint_url(url)?;
                Mode::Captcha {
                    http: Client::builder()
                        .redirect(reqwest::redirect::Policy::none())
                        .timeout(std::time::Duration::from_secs(10))
                        .build()?,
                    url: url.to_string(),
                    secret,
                }
            }
            _ => Mode::PassThrough,
        };
        Ok(Self { mode })
    }

    /// Returns `true` when no real collaborator is configured.
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        matches!(self.mode, Mode::PassThrough)
    }

    /// Check a token with the collaborator. Never panics and never returns
    /// a transport error to the caller; failures collapse into
    /// [`VerifyOutcome::CollaboratorError`].
    pub async fn check(&self, token: &str) -> VerifyOutcome {
        let Mode::Captcha { http, url, secret } = &self.mode else {
            return VerifyOutcome::Accepted;
        };

        let result = http
            .post(url)
            .form(&[("secret", secret.as_str()), ("response", token)])
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "captcha collaborator unreachable");
                return VerifyOutcome::CollaboratorError;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            warn!(status = %status, "captcha collaborator returned non-success");
            return VerifyOutcome::CollaboratorError;
        }

        match resp.json::<SiteverifyResponse>().await {
            Ok(body) if body.success => VerifyOutcome::Accepted,
            Ok(body) => {
                debug!(errors = ?body.error_codes, "captcha token rejected");
                VerifyOutcome::Rejected
            }
            Err(e) => {
                warn!(error = %e, "captcha collaborator returned unparseable body");
                VerifyOutcome::CollaboratorError
            }
        }
    }
}
