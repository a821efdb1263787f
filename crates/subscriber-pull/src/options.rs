use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ceilings on outstanding (delivered but unresolved) messages.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct FlowControlOptions {
    /// Maximum outstanding byte total.
    pub max_outstanding_bytes: usize,

    /// Maximum outstanding message count.
    pub max_outstanding_messages: usize,
}

impl Default for FlowControlOptions {
    fn default() -> Self {
        Self {
            max_outstanding_bytes: 100 * 1024 * 1024, // 100MiB
            max_outstanding_messages: 1000,
        }
    }
}

/// Automatic ack deadline extension for outstanding messages.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct LeaseOptions {
    /// Deadline requested on each extension, in seconds.
    pub ack_deadline_secs: u64,

    /// Stop extending a message once it has been outstanding this long, in seconds.
    pub max_lease_secs: u64,

    /// How often leases are extended, in seconds.
    pub refresh_period_secs: u64,
}

impl LeaseOptions {
    /// Deadline requested on each extension.
    #[must_use]
    pub const fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }

    /// Longest time a message is kept leased.
    #[must_use]
    pub const fn max_lease(&self) -> Duration {
        Duration::from_secs(self.max_lease_secs)
    }

    /// Interval between extensions.
    #[must_use]
    pub const fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 10,
            max_lease_secs: 600,
            refresh_period_secs: 5,
        }
    }
}

/// Delay before pulling again after a pull failed or came back empty.
///
/// The delay doubles on each consecutive unproductive pull up to `max_millis`
/// and resets once a pull returns messages.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PullBackoffOptions {
    /// First delay, in milliseconds.
    pub initial_millis: u64,

    /// Longest delay, in milliseconds.
    pub max_millis: u64,
}

impl PullBackoffOptions {
    /// First delay.
    #[must_use]
    pub const fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_millis)
    }

    /// Delay following `current`.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(Duration::from_millis(self.max_millis))
    }
}

impl Default for PullBackoffOptions {
    fn default() -> Self {
        Self {
            initial_millis: 100,
            max_millis: 10_000,
        }
    }
}

/// Options for [`crate::PullMessageSource`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PullSourceOptions {
    /// Outstanding message ceilings.
    pub flow_control: FlowControlOptions,

    /// Lease extension, disabled when absent.
    pub lease: Option<LeaseOptions>,

    /// Largest number of messages requested by a single pull.
    pub max_pull_batch: usize,

    /// Wait between unproductive pulls.
    pub pull_backoff: PullBackoffOptions,
}

impl Default for PullSourceOptions {
    fn default() -> Self {
        Self {
            flow_control: FlowControlOptions::default(),
            lease: None,
            max_pull_batch: 100,
            pull_backoff: PullBackoffOptions::default(),
        }
    }
}

impl PullSourceOptions {
    /// Checks the options for values the source cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.flow_control.max_outstanding_messages == 0 {
            return Err("max_outstanding_messages must be greater than zero".to_string());
        }

        if self.flow_control.max_outstanding_bytes == 0 {
            return Err("max_outstanding_bytes must be greater than zero".to_string());
        }

        if self.max_pull_batch == 0 {
            return Err("max_pull_batch must be greater than zero".to_string());
        }

        if self.pull_backoff.initial_millis == 0 {
            return Err("pull_backoff initial_millis must be greater than zero".to_string());
        }

        if self.pull_backoff.max_millis < self.pull_backoff.initial_millis {
            return Err("pull_backoff max_millis must be at least initial_millis".to_string());
        }

        if let Some(lease) = &self.lease {
            if lease.refresh_period_secs == 0 {
                return Err("lease refresh_period_secs must be greater than zero".to_string());
            }

            if lease.max_lease_secs < lease.ack_deadline_secs {
                return Err("lease max_lease_secs must be at least ack_deadline_secs".to_string());
            }
        }

        Ok(())
    }
}
