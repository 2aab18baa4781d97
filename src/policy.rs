//! Acknowledgement modes and client-side delivery policies.

use std::time::Duration;

/// The five acknowledgement regimes a session can run under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// Each delivery is acknowledged as consumed immediately.
    AutoAcknowledge,
    /// The application acknowledges explicitly; acks cover every delivery up
    /// to the acknowledged message.
    ClientAcknowledge,
    /// Lazily acknowledged deliveries; duplicates are possible after a
    /// failure.
    DupsOkAcknowledge,
    /// Deliveries are acknowledged at transaction boundaries.
    Transactional,
    /// The application acknowledges exactly one message at a time.
    IndividualAcknowledge,
}

impl AckMode {
    /// Whether this mode binds deliveries to a transaction.
    #[must_use]
    pub fn is_transacted(self) -> bool { matches!(self, Self::Transactional) }
}

/// Default prefetch credit granted per destination kind.
///
/// Prefetch is the broker-side credit: the maximum number of unacknowledged
/// messages the broker keeps pushed to one consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefetchPolicy {
    pub queue: i32,
    pub topic: i32,
    pub durable_topic: i32,
    pub queue_browser: i32,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            queue: 1000,
            topic: 32766,
            durable_topic: 100,
            queue_browser: 500,
        }
    }
}

impl PrefetchPolicy {
    /// The prefetch to apply for a consumer with the given shape.
    #[must_use]
    pub fn prefetch_for(&self, queue: bool, durable: bool, browser: bool) -> i32 {
        match (queue, browser, durable) {
            (true, true, _) => self.queue_browser,
            (true, false, _) => self.queue,
            (false, _, true) => self.durable_topic,
            (false, _, false) => self.topic,
        }
    }
}

/// Controls how rolled-back deliveries are retried.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RedeliveryPolicy {
    /// Retries allowed before a poison ack; negative means unlimited.
    pub maximum_redeliveries: i32,
    /// Delay before the first redelivery.
    pub initial_redelivery_delay: Duration,
    /// Whether successive redeliveries back off exponentially.
    pub use_exponential_backoff: bool,
    /// Multiplier applied per redelivery when backing off.
    pub backoff_multiplier: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 6,
            initial_redelivery_delay: Duration::from_secs(1),
            use_exponential_backoff: false,
            backoff_multiplier: 5.0,
        }
    }
}

impl RedeliveryPolicy {
    /// The delay to apply before redelivering a batch whose head message has
    /// already been redelivered `redelivery_count` times.
    #[must_use]
    pub fn redelivery_delay(&self, redelivery_count: i32) -> Duration {
        if !self.use_exponential_backoff || redelivery_count <= 0 {
            return self.initial_redelivery_delay;
        }
        let factor = self.backoff_multiplier.powi(redelivery_count);
        self.initial_redelivery_delay.mul_f64(factor)
    }

    /// Whether a batch whose head has been rolled back `rollback_count` times
    /// has exhausted its retries.
    #[must_use]
    pub fn is_exhausted(&self, rollback_count: i32) -> bool {
        self.maximum_redeliveries >= 0 && rollback_count > self.maximum_redeliveries
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, Duration::from_secs(1))]
    #[case(1, Duration::from_secs(2))]
    #[case(3, Duration::from_secs(8))]
    fn exponential_backoff_doubles(#[case] count: i32, #[case] expected: Duration) {
        let policy = RedeliveryPolicy {
            use_exponential_backoff: true,
            backoff_multiplier: 2.0,
            ..RedeliveryPolicy::default()
        };
        assert_eq!(policy.redelivery_delay(count), expected);
    }

    #[test]
    fn fixed_delay_without_backoff() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.redelivery_delay(5), policy.initial_redelivery_delay);
    }

    #[rstest]
    #[case(3, false)]
    #[case(4, true)]
    fn exhaustion_is_strictly_past_the_limit(#[case] rollbacks: i32, #[case] exhausted: bool) {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 3,
            ..RedeliveryPolicy::default()
        };
        assert_eq!(policy.is_exhausted(rollbacks), exhausted);
    }

    #[test]
    fn negative_maximum_never_exhausts() {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: -1,
            ..RedeliveryPolicy::default()
        };
        assert!(!policy.is_exhausted(i32::MAX));
    }

    #[rstest]
    #[case(true, false, false, 1000)]
    #[case(true, false, true, 500)]
    #[case(false, false, false, 32766)]
    #[case(false, true, false, 100)]
    fn prefetch_follows_consumer_shape(
        #[case] queue: bool,
        #[case] durable: bool,
        #[case] browser: bool,
        #[case] expected: i32,
    ) {
        let policy = PrefetchPolicy::default();
        assert_eq!(policy.prefetch_for(queue, durable, browser), expected);
    }
}
