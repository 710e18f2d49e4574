use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backoff tier an error is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTier {
    Transient,
    RateLimited,
    Fatal,
}

/// Failures a worker folds into its backoff scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl WorkerError {
    pub fn tier(&self) -> ErrorTier {
        match self {
            WorkerError::TransientNetwork(_) => ErrorTier::Transient,
            WorkerError::RateLimited(_) => ErrorTier::RateLimited,
            WorkerError::FatalConfig(_) => ErrorTier::Fatal,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::TransientNetwork(_) => "transient_network",
            WorkerError::RateLimited(_) => "rate_limited",
            WorkerError::FatalConfig(_) => "fatal_config",
        }
    }

    /// Classifies an opaque error from an external collaborator. Anything that
    /// looks like provider throttling lands in the rate-limited tier, the rest
    /// is treated as transient.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(worker_err) = err.downcast_ref::<WorkerError>() {
            return worker_err.clone();
        }

        let message = format!("{:#}", err);
        if is_rate_limit_message(&message) {
            WorkerError::RateLimited(message)
        } else {
            WorkerError::TransientNetwork(message)
        }
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["429", "503", "too many requests", "rate limit", "unexpected server response"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no baseline known for partition {0}")]
    Uninitialized(String),
    #[error("sequence space exhausted for partition {0}")]
    Exhausted(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_classify_rate_limit_responses() {
        let err = anyhow!("HTTP error 429 Too Many Requests");
        assert_eq!(WorkerError::classify(&err).tier(), ErrorTier::RateLimited);

        let err = anyhow!("Unexpected server response: 503");
        assert_eq!(WorkerError::classify(&err).tier(), ErrorTier::RateLimited);
    }

    #[test]
    fn test_classify_defaults_to_transient() {
        let err = anyhow!("connection reset by peer");
        assert_eq!(WorkerError::classify(&err).tier(), ErrorTier::Transient);
    }

    #[test]
    fn test_classify_preserves_typed_errors() {
        let err = anyhow::Error::new(WorkerError::FatalConfig("missing feed url".into()));
        assert_eq!(
            WorkerError::classify(&err),
            WorkerError::FatalConfig("missing feed url".into())
        );
    }
}
