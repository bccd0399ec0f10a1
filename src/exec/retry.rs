use crate::shared::cancel::CancelToken;
use crate::workflow::RetriesSpec;
use std::time::Duration;

/// Exit codes worth retrying under the provider contract: `1` is a retryable
/// API failure, `124` a timeout.
const RETRYABLE_CODES: [i32; 2] = [1, 124];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    retry_enabled: bool,
}

impl RetryPolicy {
    /// Providers retry on exit 1 and 124 by default; the CLI supplies the
    /// default attempt budget and delay.
    pub fn for_provider(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay: Duration::from_millis(delay_ms),
            retry_enabled: true,
        }
    }

    /// Raw commands never retry unless the step declares `retries`.
    pub fn for_command(retries: Option<&RetriesSpec>) -> Self {
        match retries {
            None => Self {
                max_retries: 0,
                delay: Duration::ZERO,
                retry_enabled: false,
            },
            Some(spec) => Self {
                max_retries: spec.max(),
                delay: Duration::from_millis(spec.delay_ms()),
                retry_enabled: true,
            },
        }
    }

    /// Step-level `retries` overrides the CLI defaults for providers too.
    pub fn for_provider_step(
        retries: Option<&RetriesSpec>,
        default_max: u32,
        default_delay_ms: u64,
    ) -> Self {
        match retries {
            None => Self::for_provider(default_max, default_delay_ms),
            Some(spec) => Self {
                max_retries: spec.max(),
                delay: Duration::from_millis(spec.delay_ms()),
                retry_enabled: true,
            },
        }
    }

    /// `attempt` is zero-based; the policy caps total attempts at
    /// `max_retries + 1`.
    pub fn should_retry(&self, exit_code: i32, attempt: u32) -> bool {
        self.retry_enabled
            && attempt < self.max_retries
            && RETRYABLE_CODES.contains(&exit_code)
    }

    /// Returns false when the inter-attempt sleep was cancelled.
    pub fn wait(&self, cancel: &CancelToken) -> bool {
        if self.delay.is_zero() {
            return !cancel.is_cancelled();
        }
        cancel.sleep(self.delay)
    }
}
