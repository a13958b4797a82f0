//! Seeded stand-in for the image editing provider

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use restage_queue::{EditExecutor, EditRequest, ExecutorError};
use restage_types::ResourceLocator;
use std::time::Duration;

/// Executor that fails at a configured rate after a random delay
///
/// The same seed and request order give the same results.
#[derive(Debug)]
pub struct SimulatedExecutor {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
}

impl SimulatedExecutor {
    /// Always succeeds immediately
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }

    /// Fraction of calls that fail, clamped to `0.0..=1.0`
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self
    }

    /// Latency drawn uniformly from `min..=max`
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min.min(max);
        self.max_latency = max.max(min);
        self
    }

    fn roll(&self) -> (bool, Duration) {
        let mut rng = self.rng.lock();
        let fail = rng.gen_bool(self.failure_rate);
        let delay = if self.max_latency > self.min_latency {
            rng.gen_range(self.min_latency..=self.max_latency)
        } else {
            self.min_latency
        };
        (fail, delay)
    }
}

#[async_trait]
impl EditExecutor for SimulatedExecutor {
    async fn execute(&self, request: &EditRequest) -> Result<ResourceLocator, ExecutorError> {
        let (fail, delay) = self.roll();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ExecutorError::Provider(format!(
                "simulated {} failure",
                request.kind
            )));
        }
        Ok(ResourceLocator::named(format!(
            "{}/{}-v{}",
            request.input_locator,
            request.kind,
            request.input_version + 1
        )))
    }
}
