//! HTTP client with timeout and bounded exponential-backoff retry.
//!
//! Connect, timeout, send and body-read failures, HTTP 429 and 5xx are
//! retried until the attempt budget is spent. An attempt covers the whole
//! exchange, so a body cut off after a 200 is retried like a failed send.
//! Any other non-success status fails on the first response. Backoff sleeps are `tokio::time::sleep`, so sibling
//! tasks keep running while one call waits.

use crate::config::Settings;
use crate::error::{Result, SynthecaError};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
        }
    }

    /// Sleep before the next attempt, after `failed` attempts have failed.
    pub fn delay_for(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Per-call request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub json: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Shared HTTP client. Cloning is cheap; retry state lives on the stack of
/// each call and is never shared.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.default_timeout)
            .build()
            .map_err(|e| SynthecaError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            policy: RetryPolicy::from_settings(settings),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt_once` until it succeeds, retrying transient failures.
    ///
    /// Fails with the fatal error itself, or with `RetriesExhausted` once
    /// the budget is spent.
    async fn with_retries<T, F, Fut>(&self, method: &Method, url: &str, mut attempt_once: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match attempt_once().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_transient() {
                debug!(method = %method, url = url, attempt = attempt, error = %err, "Fatal request error");
                return Err(err);
            }

            if attempt >= max_attempts {
                return Err(SynthecaError::RetriesExhausted {
                    method: method.to_string(),
                    url: url.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let wait = self.policy.delay_for(attempt);
            warn!(
                method = %method,
                url = url,
                attempt = attempt,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// GET and return the body as text.
    pub async fn get_text(&self, url: &str, opts: &RequestOptions) -> Result<String> {
        self.with_retries(&Method::GET, url, || self.fetch_text(Method::GET, url, opts))
            .await
    }

    /// GET and decode a JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, opts: &RequestOptions) -> Result<T> {
        let body = self.get_text(url, opts).await?;
        serde_json::from_str(&body)
            .map_err(|e| SynthecaError::Parse(format!("Invalid JSON from {}: {}", url, e)))
    }

    async fn fetch_text(&self, method: Method, url: &str, opts: &RequestOptions) -> Result<String> {
        let response = self.send_once(method, url, opts).await?;
        Ok(response.text().await?)
    }

    async fn send_once(&self, method: Method, url: &str, opts: &RequestOptions) -> Result<Response> {
        let mut request = self.http.request(method, url);
        if !opts.query.is_empty() {
            request = request.query(&opts.query);
        }
        if let Some(body) = &opts.json {
            request = request.json(body);
        }
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(SynthecaError::Http {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(20));
        assert_eq!(policy.delay_for(60), Duration::from_secs(20));
    }

    #[test]
    fn test_request_options_builder() {
        let opts = RequestOptions::new()
            .query("verb", "ListRecords")
            .query("set", "x")
            .timeout(Duration::from_secs(3));
        assert_eq!(opts.query.len(), 2);
        assert_eq!(opts.query[0], ("verb".to_string(), "ListRecords".to_string()));
        assert_eq!(opts.timeout, Some(Duration::from_secs(3)));
        assert!(opts.json.is_none());
    }

    #[test]
    fn test_policy_from_settings_never_zero() {
        let settings = Settings {
            max_attempts: 0,
            ..Settings::default()
        };
        assert_eq!(RetryPolicy::from_settings(&settings).max_attempts, 1);
    }
}
