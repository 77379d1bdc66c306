//! Failure taxonomy for remote operations.
//!
//! Two shapes of failure matter to the sync pipeline: a request that never
//! got a response (retryable), and a response with a non-2xx status (retryable
//! only for 5xx). Replay exhaustion is its own terminal case so the caller
//! can tell a dropped queued mutation apart from a direct failure.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
  /// No response was received (connection refused, timeout, DNS failure).
  #[error("network error: {0}")]
  Network(String),

  /// A response was received with a non-2xx status.
  #[error("{message} (status {status})")]
  Http {
    status: u16,
    message: String,
    /// Machine-readable error code from the response body, when present.
    code: Option<String>,
  },

  /// The response body could not be decoded as the expected JSON shape.
  #[error("invalid response: {0}")]
  InvalidResponse(String),

  /// A queued mutation failed replay past its retry maximum and was dropped.
  #[error("gave up replaying {method} {endpoint} after {attempts} attempts: {last_error}")]
  ReplayExhausted {
    method: String,
    endpoint: String,
    attempts: u32,
    last_error: String,
  },
}

impl ApiError {
  /// Whether the retry policy may schedule another attempt for this failure.
  ///
  /// 5xx and connection-level failures are transient; 4xx means the request
  /// itself is wrong and repeating it cannot help.
  pub fn is_retryable(&self) -> bool {
    match self {
      ApiError::Network(_) => true,
      ApiError::Http { status, .. } => *status >= 500,
      ApiError::InvalidResponse(_) | ApiError::ReplayExhausted { .. } => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_network_is_retryable() {
    assert!(ApiError::Network("connection refused".into()).is_retryable());
  }

  #[test]
  fn test_server_error_is_retryable() {
    let err = ApiError::Http {
      status: 503,
      message: "Service Unavailable".into(),
      code: None,
    };
    assert!(err.is_retryable());
  }

  #[test]
  fn test_client_error_is_terminal() {
    let err = ApiError::Http {
      status: 404,
      message: "Not Found".into(),
      code: Some("TASK_NOT_FOUND".into()),
    };
    assert!(!err.is_retryable());
  }

  #[test]
  fn test_replay_exhausted_is_terminal() {
    let err = ApiError::ReplayExhausted {
      method: "PATCH".into(),
      endpoint: "/tasks/t1".into(),
      attempts: 3,
      last_error: "network error".into(),
    };
    assert!(!err.is_retryable());
  }
}
