//! Simulated processing unit.
//!
//! Stand-in for a real computation: multiplies the input by a factor after a
//! random delay, and fails a configurable fraction of attempts. The failure
//! knob is what exercises the bus retry path end to end.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

use crate::domain::ids::SignalId;
use crate::ports::processor::ProcessingUnit;

pub struct SimulatedProcessor {
    name: String,
    factor: i64,
    /// Inclusive delay range in milliseconds; (0, 0) skips the sleep.
    delay_ms: (u64, u64),
    /// Probability in [0, 1] that one transform attempt fails.
    failure_probability: f64,
}

impl SimulatedProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factor: 2,
            delay_ms: (100, 1000),
            failure_probability: 0.2,
        }
    }

    pub fn with_factor(mut self, factor: i64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_delay_ms(mut self, min: u64, max: u64) -> Self {
        self.delay_ms = (min, max);
        self
    }

    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = probability;
        self
    }
}

#[async_trait]
impl ProcessingUnit for SimulatedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(&self, signal_id: SignalId, value: i64) -> Result<i64, String> {
        // Draw before any await: ThreadRng is not Send
        let (delay, failed) = {
            let mut rng = rand::thread_rng();
            let delay = if self.delay_ms.1 == 0 {
                None
            } else {
                Some(rng.gen_range(self.delay_ms.0..=self.delay_ms.1))
            };
            (delay, rng.gen_bool(self.failure_probability.clamp(0.0, 1.0)))
        };

        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if failed {
            return Err(format!("simulated failure in {}", self.name));
        }

        let output = value * self.factor;
        debug!(%signal_id, unit = %self.name, value, output, "transform done");
        Ok(output)
    }
}
