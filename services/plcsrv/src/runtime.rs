//! Runtime orchestration
//!
//! Poll scheduling, reconnection and the lifecycle of the whole core.

pub mod lifecycle;
pub mod reconnect;
pub mod scheduler;

pub use lifecycle::PlcRuntime;
pub use reconnect::{linear_backoff, ReconnectError, ReconnectHelper, ReconnectStats, RetryPolicy};
pub use scheduler::{PollScheduler, SchedulerPhase, SchedulerStats, TickOutcome};
