//! Publish throttling
//!
//! A token bucket in front of a [`Transport`]. Publishes beyond the burst
//! allowance wait for the bucket to refill instead of sleeping a fixed
//! interval per message.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use topicbus::{BusError, Transport};
use tracing::trace;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate,
            last: Instant::now(),
        }
    }

    /// Reserve one token and return how long the caller must wait for it
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Transport wrapper limiting publish rate
///
/// Subscribe and unsubscribe pass straight through.
pub struct Throttle<T> {
    inner: T,
    bucket: Option<Mutex<TokenBucket>>,
}

impl<T: Transport> Throttle<T> {
    /// Limit `inner` to `rate` publishes per second with bursts of `burst`
    ///
    /// A rate of zero (or below) disables throttling.
    pub fn new(inner: T, rate: f64, burst: u32) -> Self {
        let bucket = (rate > 0.0).then(|| Mutex::new(TokenBucket::new(rate, burst)));
        Self { inner, bucket }
    }

    async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let wait = {
            let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.reserve(Instant::now())
        };
        if !wait.is_zero() {
            trace!(wait_ms = wait.as_millis() as u64, "Throttle: waiting for token");
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for Throttle<T> {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        self.acquire().await;
        self.inner.publish(topic, payload, retain).await
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        self.inner.subscribe(filter).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        self.inner.unsubscribe(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topicbus::{Broker, BrokerConfig};

    #[test]
    fn test_bucket_allows_burst_then_spaces() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 3);

        for _ in 0..3 {
            assert_eq!(bucket.reserve(start), Duration::ZERO);
        }
        let wait = bucket.reserve(start);
        assert!((wait.as_secs_f64() - 0.1).abs() < 1e-9);
        let wait = bucket.reserve(start);
        assert!((wait.as_secs_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_refills_up_to_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 2);
        bucket.reserve(start);
        bucket.reserve(start);

        let later = start + Duration::from_secs(10);
        assert_eq!(bucket.reserve(later), Duration::ZERO);
        assert_eq!(bucket.reserve(later), Duration::ZERO);
        assert!(bucket.reserve(later) > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_throttled_publish_waits() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (client, _inbox) = broker.connect("pub", None).await.unwrap();
        let throttle = Throttle::new(client, 20.0, 1);

        let start = Instant::now();
        throttle.publish_text("a/b", "1", false).await.unwrap();
        throttle.publish_text("a/b", "2", false).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_zero_rate_is_unthrottled() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (client, _inbox) = broker.connect("pub", None).await.unwrap();
        let throttle = Throttle::new(client, 0.0, 1);
        assert!(throttle.bucket.is_none());
        for i in 0..100 {
            throttle.publish_text("a/b", &i.to_string(), false).await.unwrap();
        }
    }
}
