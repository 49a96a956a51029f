// =============================================================================
// Venue time synchronisation
// =============================================================================
//
// Samples the venue's server time, halves the observed round-trip as network
// latency, and maintains an offset `server - (local + latency/2)` applied to
// every signed-request timestamp.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::VenueGateway;

/// Interval between offset samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Lock-free clock offset shared with request signers.
pub struct TimeSync {
    offset_ms: AtomicI64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Local wall clock in milliseconds adjusted by the learned offset.
    pub fn adjusted_timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Take one sample against `gateway`. A gateway without server-time
    /// support leaves the offset untouched.
    pub async fn sample(&self, gateway: &dyn VenueGateway) {
        let local_before = Utc::now().timestamp_millis();
        match gateway.get_server_time().await {
            Ok(Some(server_ms)) => {
                let local_after = Utc::now().timestamp_millis();
                let latency = (local_after - local_before) / 2;
                let offset = server_ms - (local_before + latency / 2);
                self.offset_ms.store(offset, Ordering::Relaxed);
                debug!(offset_ms = offset, latency_ms = latency, "clock offset sampled");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "server time sample failed");
            }
        }
    }

    /// Periodic sampling loop; exits on cancellation.
    pub async fn run(
        self: Arc<Self>,
        gateway: Arc<dyn VenueGateway>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    self.sample(gateway.as_ref()).await;
                }
            }
        }
    }
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoreError;
    use crate::gateway::{OrderRequest, OrderResult};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FixedClockGateway {
        server_ms: i64,
    }

    #[async_trait]
    impl VenueGateway for FixedClockGateway {
        fn exchange(&self) -> &str {
            "test"
        }
        async fn submit_order(&self, _req: &OrderRequest) -> Result<OrderResult, CoreError> {
            Err(CoreError::Gateway("unsupported".into()))
        }
        async fn cancel_order(&self, _symbol: &str, _id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn get_server_time(&self) -> Result<Option<i64>, CoreError> {
            Ok(Some(self.server_ms))
        }
    }

    #[tokio::test]
    async fn sample_learns_offset() {
        let sync = TimeSync::new();
        let ahead = FixedClockGateway {
            server_ms: Utc::now().timestamp_millis() + 5_000,
        };
        sync.sample(&ahead).await;
        assert!(sync.offset_ms() > 4_000, "offset {}", sync.offset_ms());
        let adjusted = sync.adjusted_timestamp_ms();
        assert!(adjusted > Utc::now().timestamp_millis() + 4_000);
    }

    #[tokio::test]
    async fn unsupported_gateway_leaves_offset_zero() {
        #[derive(Debug)]
        struct NoClock;
        #[async_trait]
        impl VenueGateway for NoClock {
            fn exchange(&self) -> &str {
                "test"
            }
            async fn submit_order(&self, _r: &OrderRequest) -> Result<OrderResult, CoreError> {
                Err(CoreError::Gateway("unsupported".into()))
            }
            async fn cancel_order(&self, _s: &str, _i: &str) -> Result<(), CoreError> {
                Ok(())
            }
        }
        let sync = TimeSync::new();
        sync.sample(&NoClock).await;
        assert_eq!(sync.offset_ms(), 0);
    }
}
