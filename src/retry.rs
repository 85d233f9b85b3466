use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::KeeperError;

/// Decides whether a given error is worth retrying. Defaults to
/// [`KeeperError::is_transient`] when no classifier is supplied.
pub type Classifier = Box<dyn Fn(&KeeperError) -> bool + Send + Sync>;

/// Wraps a fallible async action with bounded exponential backoff (§4.3).
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Option<Classifier>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy {
            config,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    fn is_retryable(&self, err: &KeeperError) -> bool {
        match &self.classifier {
            Some(f) => f(err),
            None => err.is_transient(),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled =
            self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `action` until it succeeds, a non-retryable error is returned, or
    /// `max_retries` attempts are exhausted. On exhaustion, the last error is
    /// returned.
    pub async fn run<T, F, Fut>(&self, mut action: F) -> Result<T, KeeperError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, KeeperError>>,
    {
        let mut attempt = 0;
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.is_retryable(&err) || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
