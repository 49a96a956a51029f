// =============================================================================
// Execution — order queue plus the executor drain loop
// =============================================================================

pub mod executor;
pub mod queue;

pub use executor::OrderExecutor;
pub use queue::{OrderQueue, QueueMetrics};
