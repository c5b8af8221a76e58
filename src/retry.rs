//! Per-call retry helper
//!
//! Stateless retry with exponential backoff for a single RPC. Only statuses
//! in the retryable class are retried: `Unavailable`, `DeadlineExceeded`,
//! `ResourceExhausted` and `Internal`. Anything else is returned on the spot.
//!
//! This helper knows nothing about channels. Channel-level recovery belongs
//! to [`crate::reconnect::ReconnectController`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::config::ConfigError;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based; 0 means no delay)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier".to_string(),
                reason: "Must be at least 1.0".to_string(),
            });
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_delay_ms".to_string(),
                reason: "Must not be lower than base_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Status Classification
// ============================================================================

/// Whether a status belongs to the retryable class
pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Internal
    )
}

/// Human readable description of a status code
pub fn code_description(code: Code) -> &'static str {
    match code {
        Code::Ok => "Success",
        Code::Cancelled => "Operation cancelled",
        Code::Unknown => "Unknown error",
        Code::InvalidArgument => "Invalid request parameters",
        Code::DeadlineExceeded => "Request timeout",
        Code::NotFound => "Resource not found",
        Code::AlreadyExists => "Resource already exists",
        Code::PermissionDenied => "Permission denied",
        Code::ResourceExhausted => "Resource exhausted",
        Code::FailedPrecondition => "Precondition failed",
        Code::Aborted => "Operation aborted",
        Code::OutOfRange => "Out of range",
        Code::Unimplemented => "Not implemented",
        Code::Internal => "Internal server error",
        Code::Unavailable => "Service unavailable",
        Code::DataLoss => "Data loss",
        Code::Unauthenticated => "Authentication required",
    }
}

/// Description plus the status message, for logs
pub fn describe_status(status: &Status) -> String {
    let description = code_description(status.code());
    if status.message().is_empty() {
        description.to_string()
    } else {
        format!("{}: {}", description, status.message())
    }
}

// ============================================================================
// Retry Loop
// ============================================================================

/// Run `call` until it succeeds, fails with a non-retryable status, or
/// `config.max_retries` retries are spent
///
/// Returns the last status on failure.
///
/// # Example
///
/// ```no_run
/// use hello_discovery::retry::{retry_call, RetryConfig};
/// use tonic::Status;
///
/// # async fn demo() -> Result<(), Status> {
/// let config = RetryConfig::default();
/// let reply = retry_call("talk", &config, || async {
///     Ok::<_, Status>("hello".to_string())
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_call<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    mut call: F,
) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = config.delay_for(attempt);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying call after delay"
            );
            tokio::time::sleep(delay).await;
        }

        match call().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Call succeeded after retry");
                }
                return Ok(result);
            }
            Err(status) if !is_retryable(&status) => {
                warn!(operation, error = %describe_status(&status), "Non-retryable error");
                return Err(status);
            }
            Err(status) if attempt >= config.max_retries => {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    error = %describe_status(&status),
                    "Call failed, retries exhausted"
                );
                return Err(status);
            }
            Err(status) => {
                warn!(
                    operation,
                    attempt,
                    max_retries = config.max_retries,
                    error = %describe_status(&status),
                    "Retryable error"
                );
                attempt += 1;
            }
        }
    }
}
