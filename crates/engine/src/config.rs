//! Tuning knobs for the engine and its background sweeper.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of times a retryable action failure will be retried.
    pub max_action_retries: u32,
    /// Base delay for exponential back-off between action retries.
    pub retry_base_delay: Duration,
    /// Ceiling on a single back-off delay.
    pub max_retry_delay: Duration,
    /// Percentage of an SLA budget after which a state counts as "approaching"
    /// when no approaching escalation states its own threshold.
    pub default_approaching_percent: f64,
    /// How often the sweeper scans SLAs and pending approvals.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_action_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(30),
            default_approaching_percent: 80.0,
            sweep_interval: Duration::from_secs(60),
        }
    }
}
