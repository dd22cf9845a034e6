//! Inter-batch pacing policies.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

/// Called between write batches to stay under external rate limits.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn wait_before_next_batch(&self);
}

/// Sleep a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Pacer for FixedDelay {
    async fn wait_before_next_batch(&self) {
        trace!(delay_ms = self.delay.as_millis() as u64, "pacing");
        tokio::time::sleep(self.delay).await;
    }
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

#[async_trait]
impl Pacer for NoPacing {
    async fn wait_before_next_batch(&self) {}
}

/// Pick a pacer for a configured delay.
pub fn pacer_for(pacing_ms: u64) -> Box<dyn Pacer> {
    if pacing_ms == 0 {
        Box::new(NoPacing)
    } else {
        Box::new(FixedDelay::from_millis(pacing_ms))
    }
}
