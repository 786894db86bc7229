//! Retry with exponential backoff for upstream HTTP calls.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! `max_retries = 0` (the default) sends exactly one request.

use std::time::Duration;
use tracing::warn;

/// Outcome of a failed attempt.
#[derive(Debug)]
pub enum Attempt {
    /// Worth trying again.
    Transient(String),
    /// Retrying cannot help.
    Fatal(String),
}

/// Send a request, retrying transient failures.
///
/// `build` is called once per attempt and must produce a fresh request.
/// Returns the first successful response, or the last error message.
pub async fn send_with_retry<F>(
    label: &str,
    max_retries: u32,
    mut build: F,
) -> Result<reqwest::Response, String>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            warn!(
                "{} request failed (attempt {}/{}), retrying after {}s",
                label,
                attempt,
                max_retries + 1,
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
        }

        match classify(build().send().await).await {
            Ok(response) => return Ok(response),
            Err(Attempt::Fatal(msg)) => return Err(msg),
            Err(Attempt::Transient(msg)) => last_err = Some(msg),
        }
    }

    Err(last_err.unwrap_or_else(|| format!("{} request failed after retries", label)))
}

async fn classify(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, Attempt> {
    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return Err(Attempt::Transient(format!("timed out: {}", e))),
        Err(e) => return Err(Attempt::Transient(e.to_string())),
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let msg = format!("HTTP {}: {}", status, upstream_message(&body));

    if status.as_u16() == 429 || status.is_server_error() {
        Err(Attempt::Transient(msg))
    } else {
        Err(Attempt::Fatal(msg))
    }
}

/// Pull `error.message` out of an upstream error body when present.
pub fn upstream_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}
