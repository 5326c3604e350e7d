use std::time::Duration;

use rand::Rng;
use relaydesk_common::Result;
use relaydesk_config::DeliveryConfig;
use tracing::warn;

use crate::traits::{ChannelAdapter, DeliveryResult, SendOptions};

/// Bounded exponential backoff for transient delivery failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.backoff_ms),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), with up to 50% jitter added.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Send through `adapter`, retrying only errors marked transient.
pub async fn send_with_retry(
    adapter: &dyn ChannelAdapter,
    recipient: &str,
    content: &str,
    options: &SendOptions,
    policy: &RetryPolicy,
) -> Result<DeliveryResult> {
    let mut attempt = 0;
    loop {
        match adapter.send(recipient, content, options).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                warn!(
                    "{}: transient delivery failure (attempt {}), retrying in {:?}: {e}",
                    adapter.channel_type(),
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaydesk_common::{ChannelType, Error, NormalizedMessage};
    use std::sync::Mutex;

    use crate::traits::{ChannelStatus, InboundRequest};

    /// Fails with the queued errors, then succeeds.
    struct FlakyAdapter {
        failures: Mutex<Vec<Error>>,
        calls: Mutex<u32>,
    }

    impl FlakyAdapter {
        fn new(failures: Vec<Error>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChannelAdapter for FlakyAdapter {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Telegram
        }
        fn display_name(&self) -> &str {
            "Flaky"
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus::Connected
        }
        fn verify_inbound(&self, _request: &InboundRequest) -> Result<()> {
            Ok(())
        }
        fn normalize_inbound(&self, _payload: &serde_json::Value) -> Vec<NormalizedMessage> {
            Vec::new()
        }
        async fn send(&self, _: &str, _: &str, _: &SendOptions) -> Result<DeliveryResult> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(DeliveryResult::delivered(Some("ok".into()))),
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let adapter = FlakyAdapter::new(vec![
            Error::delivery("telegram", "503", true),
            Error::delivery("telegram", "429", true),
        ]);
        let result = send_with_retry(&adapter, "1", "hi", &SendOptions::default(), &fast_policy(2))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let adapter = FlakyAdapter::new(vec![Error::delivery("telegram", "400", false)]);
        let err = send_with_retry(&adapter, "1", "hi", &SendOptions::default(), &fast_policy(5))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let adapter = FlakyAdapter::new(vec![
            Error::delivery("telegram", "503", true),
            Error::delivery("telegram", "503", true),
            Error::delivery("telegram", "503", true),
        ]);
        let err = send_with_retry(&adapter, "1", "hi", &SendOptions::default(), &fast_policy(1))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(adapter.calls(), 2);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        let first = policy.delay(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let capped = policy.delay(8);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1500));
    }
}
