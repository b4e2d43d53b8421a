use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

use crate::transport::QueueOptions;
use crate::Error;

/// How many unacknowledged messages the broker pushes to a subscription, unless configured
/// otherwise.
pub const DEFAULT_PREFETCH_BOUND: i32 = 260;
pub const DEFAULT_CHECK_CHANNEL_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(4);

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
/// Configuration of a single queue subscription.
///
/// Durations are expressed in milliseconds when deserialised.
pub struct SubscriptionSettings {
    /// The queue we consume from. It is declared, if missing, before registering the consumer.
    pub queue_name: String,
    /// Declare the queue as durable - it survives a broker restart.
    #[serde(default = "default_durable")]
    pub durable: bool,
    /// Declare the queue as auto-delete - it goes away together with its last consumer.
    #[serde(default)]
    pub auto_delete: bool,
    /// Let the broker consider messages settled as soon as they are delivered.
    ///
    /// Acking/nacking an envelope is then a local operation.
    #[serde(default)]
    pub auto_ack: bool,
    /// Maximum number of unacknowledged messages in flight. `0` means unbounded.
    #[serde(default = "default_prefetch_bound")]
    pub prefetch_bound: i32,
    /// How often the health check inspects the channel.
    #[serde(
        rename = "check_channel_period_ms",
        default = "default_check_channel_period",
        deserialize_with = "duration_from_millis"
    )]
    pub check_channel_period: Duration,
    /// How long to wait before every resubscription attempt.
    #[serde(
        rename = "resubscribe_delay_ms",
        default = "default_resubscribe_delay",
        deserialize_with = "duration_from_millis"
    )]
    pub resubscribe_delay: Duration,
}

impl SubscriptionSettings {
    /// Default settings for `queue_name`.
    pub fn new<T: Into<String>>(queue_name: T) -> Self {
        Self {
            queue_name: queue_name.into(),
            durable: default_durable(),
            auto_delete: false,
            auto_ack: false,
            prefetch_bound: DEFAULT_PREFETCH_BOUND,
            check_channel_period: DEFAULT_CHECK_CHANNEL_PERIOD,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    #[must_use]
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Checks the settings without touching the network.
    pub(crate) fn validate(self) -> Result<SubscriptionConfig, Error> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::Configuration("the queue name is empty".into()));
        }
        let prefetch_count = u16::try_from(self.prefetch_bound).map_err(|_| {
            Error::Configuration(format!(
                "the prefetch bound must be between 0 and {}, got {}",
                u16::MAX,
                self.prefetch_bound
            ))
        })?;
        if self.check_channel_period.is_zero() {
            return Err(Error::Configuration(
                "the channel health check period must be greater than zero".into(),
            ));
        }
        if self.resubscribe_delay.is_zero() {
            return Err(Error::Configuration(
                "the resubscribe delay must be greater than zero".into(),
            ));
        }
        Ok(SubscriptionConfig {
            queue_name: self.queue_name,
            queue_options: QueueOptions {
                durable: self.durable,
                auto_delete: self.auto_delete,
            },
            auto_ack: self.auto_ack,
            prefetch_count,
            check_channel_period: self.check_channel_period,
            resubscribe_delay: self.resubscribe_delay,
        })
    }
}

/// Validated [`SubscriptionSettings`].
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionConfig {
    pub(crate) queue_name: String,
    pub(crate) queue_options: QueueOptions,
    pub(crate) auto_ack: bool,
    pub(crate) prefetch_count: u16,
    pub(crate) check_channel_period: Duration,
    pub(crate) resubscribe_delay: Duration,
}

fn default_durable() -> bool {
    true
}

fn default_prefetch_bound() -> i32 {
    DEFAULT_PREFETCH_BOUND
}

fn default_check_channel_period() -> Duration {
    DEFAULT_CHECK_CHANNEL_PERIOD
}

fn default_resubscribe_delay() -> Duration {
    DEFAULT_RESUBSCRIBE_DELAY
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis: u64 = deserialize_number_from_string(deserializer)?;
    Ok(Duration::from_millis(millis))
}
