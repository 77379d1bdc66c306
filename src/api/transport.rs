//! HTTP transport with bounded retry.
//!
//! [`Transport`] is the single seam through which every remote operation
//! flows. The production implementation wraps reqwest; the sync coordinator
//! is tested against scripted implementations of the same trait.

use std::future::Future;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
pub use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::api::error::ApiError;
use crate::config::Config;
use crate::store::AuthStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  fn to_reqwest(self) -> reqwest::Method {
    match self {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unknown method: {other}")),
    }
  }
}

/// A single remote operation: method, path relative to the API base, and an
/// optional JSON body.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub endpoint: String,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: Method, endpoint: impl Into<String>, body: Option<Value>) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      body,
    }
  }

  pub fn get(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Get, endpoint, None)
  }
}

/// Issues a single request and classifies the outcome.
///
/// Implementations must not mutate any domain state.
pub trait Transport: Send + Sync {
  fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<Value, ApiError>>;
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
  /// The same delay before every attempt.
  Fixed,
  /// Delay doubles per attempt, capped at 30s.
  Exponential,
}

/// Bounded retry for transient failures.
///
/// The budget counts attempts, not retries: `max_attempts = 3` means the
/// request is sent at most three times. Once the budget is exhausted the
/// last failure surfaces to the caller as terminal.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub delay: Duration,
  pub backoff: Backoff,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      delay: Duration::from_millis(1000),
      backoff: Backoff::Fixed,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (zero-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    match self.backoff {
      Backoff::Fixed => self.delay,
      Backoff::Exponential => {
        let millis = self
          .delay
          .as_millis()
          .saturating_mul(2u128.saturating_pow(attempt))
          .min(30_000);
        Duration::from_millis(millis as u64)
      }
    }
  }
}

/// Run `attempt_fn` under the policy, sleeping between transient failures.
pub async fn send_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<T, ApiError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ApiError>>,
{
  let mut attempt = 0u32;
  loop {
    match attempt_fn().await {
      Ok(value) => return Ok(value),
      Err(err) => {
        attempt += 1;
        if !err.is_retryable() || attempt >= policy.max_attempts.max(1) {
          return Err(err);
        }
        let delay = policy.delay_for(attempt - 1);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "transient failure, retrying: {err}");
        tokio::time::sleep(delay).await;
      }
    }
  }
}

/// Error body shape the server attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
  message: Option<String>,
  code: Option<String>,
}

/// reqwest-backed transport with bearer auth injection.
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
  auth: AuthStore,
  policy: RetryPolicy,
}

impl HttpTransport {
  pub fn new(config: &Config, auth: AuthStore) -> Result<Self> {
    // Validate the base URL up front so a typo fails at startup, not on the
    // first request.
    Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.api.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.api.timeout_ms))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.api.base_url.trim_end_matches('/').to_string(),
      auth,
      policy: config.api.retry_policy(),
    })
  }

  async fn send_once(&self, request: &ApiRequest) -> Result<Value, ApiError> {
    let url = format!("{}{}", self.base_url, request.endpoint);

    let mut builder = self
      .client
      .request(request.method.to_reqwest(), &url)
      .header(CONTENT_TYPE, "application/json");

    if let Some(token) = self.auth.token() {
      builder = builder.bearer_auth(token);
    }

    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Network(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;
      if bytes.is_empty() {
        return Ok(Value::Null);
      }
      return serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidResponse(e.to_string()));
    }

    // Prefer the server's {message, code} body; fall back to the status line.
    let fallback = status
      .canonical_reason()
      .unwrap_or("request failed")
      .to_string();
    let (message, code) = match response.json::<ErrorBody>().await {
      Ok(body) => (body.message.unwrap_or(fallback), body.code),
      Err(_) => (fallback, None),
    };

    Err(ApiError::Http {
      status: status.as_u16(),
      message,
      code,
    })
  }
}

impl Transport for HttpTransport {
  fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<Value, ApiError>> {
    Box::pin(async move { send_with_retry(&self.policy, || self.send_once(request)).await })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn instant_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      delay: Duration::ZERO,
      backoff: Backoff::Fixed,
    }
  }

  #[test]
  fn test_fixed_backoff_is_constant() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
  }

  #[test]
  fn test_exponential_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      max_attempts: 10,
      delay: Duration::from_millis(250),
      backoff: Backoff::Exponential,
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(250));
    assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(20), Duration::from_millis(30_000));
  }

  #[tokio::test]
  async fn test_retry_recovers_from_transient_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result = send_with_retry(&instant_policy(3), move || {
      let calls = calls_clone.clone();
      async move {
        if calls.fetch_add(1, Ordering::SeqCst) < 1 {
          Err(ApiError::Network("connection reset".into()))
        } else {
          Ok(serde_json::json!({"ok": true}))
        }
      }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_retry_budget_is_capped() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result: Result<Value, _> = send_with_retry(&instant_policy(3), move || {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::Http {
          status: 503,
          message: "Service Unavailable".into(),
          code: None,
        })
      }
    })
    .await;

    assert!(matches!(result, Err(ApiError::Http { status: 503, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_terminal_failure_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result: Result<Value, _> = send_with_retry(&instant_policy(3), move || {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::Http {
          status: 400,
          message: "Bad Request".into(),
          code: None,
        })
      }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_method_round_trips_through_str() {
    for method in [Method::Get, Method::Post, Method::Put, Method::Patch, Method::Delete] {
      assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
    }
  }
}
