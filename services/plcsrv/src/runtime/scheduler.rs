//! Poll cycle scheduler
//!
//! One scheduler per monitored device. Each tick reads the device's address
//! set through the shared session, translates the snapshot and publishes it.
//! Reconnects run as background tasks so the timer keeps firing while the
//! PLC is away; ticks arriving during a reconnect are skipped.
//!
//! Failures are tagged with the session's connect-cycle generation. Devices
//! sharing a PLC therefore force one reconnect per lost connection: a
//! failure streak ends once any cycle has completed since it began.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::linear_backoff;
use crate::broadcaster::{OnDemandRequest, UpdateBroadcaster};
use crate::catalog::Catalog;
use crate::config::SchedulerConfig;
use crate::error::{ConnectionError, PlcError, ReadError, Result};
use crate::session::{ConnectionState, DeviceSession};
use crate::translator::{translate, DomainRecord};
use crate::value::DeviceId;

/// Result of a background reconnect and when its cycle ended
type ReconnectTask = JoinHandle<(std::result::Result<(), ConnectionError>, Instant)>;

/// Where the scheduler is within its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPhase {
    Idle,
    Polling,
    Reconnecting,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Published { sequence: u64 },
    /// Counted failure; `failures` is the consecutive count after this tick
    ReadFailed { failures: u32 },
    /// Not counted (cancelled, or the link dropped mid-read)
    Skipped,
    ReconnectStarted { forced: bool },
    ReconnectInFlight,
    /// Reconnect wanted but the back-off has not elapsed
    BackingOff { remaining: Duration },
}

/// Per-device counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub polls: u64,
    pub published: u64,
    pub failed_polls: u64,
    pub reconnects_started: u64,
    pub forced_reconnects: u64,
    pub on_demand_served: u64,
    /// Times reconnection gave up after `max_retries` failed cycles in a row
    pub persistent_failures: u64,
}

/// Poll loop of one device
pub struct PollScheduler {
    device: DeviceId,
    session: Arc<DeviceSession>,
    catalog: Arc<Catalog>,
    broadcaster: Arc<UpdateBroadcaster>,
    addresses: Vec<String>,
    cycle: Duration,
    retry_interval: Duration,
    persistent_retry: Duration,
    max_failures: u32,
    max_reconnect_cycles: u32,
    failure_count: u32,
    /// Session cycle generation the current failure streak was seen on
    failure_generation: u64,
    phase: SchedulerPhase,
    reconnect_task: Option<ReconnectTask>,
    /// End of the last failed reconnect cycle, the back-off runs from here
    last_failed_cycle_end: Option<Instant>,
    failed_reconnect_cycles: u32,
    gave_up: bool,
    on_demand_rx: mpsc::Receiver<OnDemandRequest>,
    stats: SchedulerStats,
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("device", &self.device)
            .field("phase", &self.phase)
            .field("failure_count", &self.failure_count)
            .field("gave_up", &self.gave_up)
            .finish()
    }
}

impl PollScheduler {
    /// Build the scheduler and register the device with the broadcaster
    pub fn new(
        device: DeviceId,
        session: Arc<DeviceSession>,
        catalog: Arc<Catalog>,
        broadcaster: Arc<UpdateBroadcaster>,
        cycle: Duration,
        settings: &SchedulerConfig,
    ) -> Result<Self> {
        catalog.device(device.as_str())?;
        let addresses = catalog.addresses_for_device(device.as_str());
        if addresses.is_empty() {
            return Err(PlcError::config(format!("device {} has no addresses", device)));
        }
        if cycle.is_zero() {
            return Err(PlcError::config(format!("device {} has a zero poll cycle", device)));
        }

        let retry_interval = session.endpoint().retry_interval();
        let max_reconnect_cycles = session.endpoint().max_retries.max(1);
        let on_demand_rx = broadcaster.register_device(device.clone());

        Ok(Self {
            device,
            session,
            catalog,
            broadcaster,
            addresses,
            cycle,
            retry_interval,
            persistent_retry: settings.persistent_retry(),
            max_failures: settings.max_consecutive_failures.max(1),
            max_reconnect_cycles,
            failure_count: 0,
            failure_generation: 0,
            phase: SchedulerPhase::Idle,
            reconnect_task: None,
            last_failed_cycle_end: None,
            failed_reconnect_cycles: 0,
            gave_up: false,
            on_demand_rx,
            stats: SchedulerStats::default(),
        })
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Reconnection gave up and only retries at the persistent interval
    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Drive the scheduler until `shutdown` fires
    ///
    /// Missed ticks are skipped. A session falling to `Disconnected` between
    /// ticks (keep-alive) starts a reconnect right away.
    pub async fn run(mut self, shutdown: CancellationToken) -> SchedulerStats {
        let mut ticker = tokio::time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut state_rx = self.session.subscribe_state();

        info!("{} polling every {}ms", self.device, self.cycle.as_millis());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    debug!("{} tick: {:?}", self.device, outcome);
                },
                Some(request) = self.on_demand_rx.recv() => {
                    self.serve_on_demand(request).await;
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    if state == ConnectionState::Disconnected {
                        self.on_disconnected();
                    }
                },
            }
        }

        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        debug!("{} scheduler stopped", self.device);
        self.stats
    }

    /// Run one poll cycle
    pub async fn tick(&mut self) -> TickOutcome {
        self.collect_reconnect().await;
        if self.reconnect_task.is_some() {
            return TickOutcome::ReconnectInFlight;
        }
        if !self.session.is_connected() {
            return self.start_reconnect(false);
        }

        self.phase = SchedulerPhase::Polling;
        self.stats.polls += 1;
        let generation = self.session.cycle_generation();
        let outcome = match self.read_record().await {
            Ok(record) => {
                self.failure_count = 0;
                let update = self.broadcaster.publish(&self.device, record);
                self.stats.published += 1;
                TickOutcome::Published {
                    sequence: update.sequence,
                }
            },
            Err(PlcError::Read(e)) if e.counts_as_failure() => self.record_failure(&e, generation),
            Err(e) => {
                debug!("{} poll skipped: {}", self.device, e);
                TickOutcome::Skipped
            },
        };
        if self.phase == SchedulerPhase::Polling {
            self.phase = SchedulerPhase::Idle;
        }
        outcome
    }

    /// Read the device's addresses and translate them
    async fn read_record(&self) -> Result<DomainRecord> {
        let snapshot = self.session.read_batch(&self.addresses).await?;
        if !snapshot.is_valid() {
            return Err(ReadError::InvalidSnapshot.into());
        }
        Ok(translate(&self.catalog, self.device.as_str(), &snapshot)?)
    }

    fn record_failure(&mut self, err: &ReadError, generation: u64) -> TickOutcome {
        if self.failure_count > 0 && generation != self.failure_generation {
            debug!(
                "{} session reconnected since failure {}, restarting the count",
                self.device, self.failure_count
            );
            self.failure_count = 0;
        }
        self.failure_generation = generation;
        self.failure_count += 1;
        self.stats.failed_polls += 1;
        warn!(
            "{} poll failed ({}/{}): {}",
            self.device, self.failure_count, self.max_failures, err
        );

        if self.failure_count >= self.max_failures {
            let reason = format!("{} consecutive read failures", self.failure_count);
            self.broadcaster.mark_unavailable(&self.device, reason);
            return self.start_reconnect(true);
        }
        TickOutcome::ReadFailed {
            failures: self.failure_count,
        }
    }

    // ========================================================================
    // Reconnection
    // ========================================================================

    fn on_disconnected(&mut self) {
        if self.reconnect_task.is_some() {
            return;
        }
        let outcome = self.start_reconnect(false);
        debug!("{} saw the session drop: {:?}", self.device, outcome);
    }

    /// Pause required after the last failed cycle before the next one
    fn backoff(&self) -> Duration {
        if self.gave_up {
            self.persistent_retry
        } else {
            linear_backoff(self.retry_interval, self.failed_reconnect_cycles)
        }
    }

    /// Spawn a reconnect unless one is running or the back-off forbids it
    ///
    /// Forced reconnects tear the link down first and skip the back-off. They
    /// carry the generation of the failure streak, so a peer device that
    /// already replaced the connection is not torn down again.
    fn start_reconnect(&mut self, forced: bool) -> TickOutcome {
        if self.reconnect_task.is_some() {
            return TickOutcome::ReconnectInFlight;
        }
        if !forced {
            if let Some(end) = self.last_failed_cycle_end {
                let backoff = self.backoff();
                let elapsed = end.elapsed();
                if elapsed < backoff {
                    return TickOutcome::BackingOff {
                        remaining: backoff - elapsed,
                    };
                }
            }
        }

        let session = Arc::clone(&self.session);
        self.reconnect_task = Some(if forced {
            warn!("{} forcing reconnect of {}", self.device, session.endpoint().id);
            self.stats.forced_reconnects += 1;
            let seen = self.failure_generation;
            tokio::spawn(async move { (session.reconnect_since(seen).await, Instant::now()) })
        } else {
            tokio::spawn(async move { (session.connect().await, Instant::now()) })
        });
        self.stats.reconnects_started += 1;
        self.phase = SchedulerPhase::Reconnecting;
        TickOutcome::ReconnectStarted { forced }
    }

    /// Take the result of a finished reconnect task
    async fn collect_reconnect(&mut self) {
        let finished = self
            .reconnect_task
            .as_ref()
            .is_some_and(|task| task.is_finished());
        if !finished {
            return;
        }
        let Some(task) = self.reconnect_task.take() else {
            return;
        };
        self.phase = SchedulerPhase::Idle;

        let (failure, ended) = match task.await {
            Ok((Ok(()), _)) => {
                if self.gave_up {
                    info!(
                        "[STATUS] {} PERSISTENT_FAILURE -> CONNECTED - reconnected after {} failed cycles",
                        self.device, self.failed_reconnect_cycles
                    );
                } else {
                    info!("{} reconnected", self.device);
                }
                self.failure_count = 0;
                self.failed_reconnect_cycles = 0;
                self.last_failed_cycle_end = None;
                self.gave_up = false;
                return;
            },
            Ok((Err(e), ended)) => (e.to_string(), ended),
            Err(e) => {
                error!("{} reconnect task failed: {}", self.device, e);
                (format!("reconnect task failed: {}", e), Instant::now())
            },
        };

        self.failed_reconnect_cycles = self.failed_reconnect_cycles.saturating_add(1);
        self.last_failed_cycle_end = Some(ended);
        warn!(
            "{} reconnect failed (cycle {}/{}): {}",
            self.device, self.failed_reconnect_cycles, self.max_reconnect_cycles, failure
        );

        if self.failed_reconnect_cycles < self.max_reconnect_cycles {
            self.broadcaster
                .mark_unavailable(&self.device, format!("reconnect failed: {}", failure));
            return;
        }
        if !self.gave_up {
            self.gave_up = true;
            self.stats.persistent_failures += 1;
            error!(
                "[STATUS] {} UNAVAILABLE -> PERSISTENT_FAILURE - {} reconnect cycles failed, retrying every {}ms",
                self.device,
                self.failed_reconnect_cycles,
                self.persistent_retry.as_millis()
            );
        }
        self.broadcaster.mark_persistent_failure(
            &self.device,
            format!(
                "gave up after {} reconnect cycles: {}",
                self.failed_reconnect_cycles, failure
            ),
        );
    }

    // ========================================================================
    // On-demand reads
    // ========================================================================

    /// Serve a one-shot read between polls
    ///
    /// The record is published like a poll result but failures are not
    /// counted toward the reconnect threshold.
    async fn serve_on_demand(&mut self, request: OnDemandRequest) {
        let result = if self.reconnect_task.is_some() {
            Err(PlcError::unavailable(self.device.as_str(), "reconnecting"))
        } else {
            self.read_record().await
        };

        if let Ok(record) = &result {
            self.broadcaster.publish(&self.device, record.clone());
            self.stats.on_demand_served += 1;
        }
        if request.reply.send(result).is_err() {
            debug!("{} on-demand requester went away", self.device);
        }
    }
}
