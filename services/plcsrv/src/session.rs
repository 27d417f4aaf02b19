//! Device session
//!
//! Owns the single connection to one PLC endpoint. Every transport call goes
//! through one async mutex, so devices polled from the same PLC never
//! interleave their batches. The connection state is published on a watch
//! channel; only the session writes it.

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeviceEndpoint;
use crate::error::{ConnectionError, ReadError, TransportError, WriteError};
use crate::runtime::reconnect::{ReconnectError, ReconnectHelper, ReconnectStats};
use crate::transport::S7Transport;
use crate::value::{PlcValue, RawSnapshot};

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Outcome of a failed transport call wrapped in timeout and cancellation
enum CallError {
    Cancelled,
    Timeout,
    Transport(TransportError),
}

/// Await a timed transport call unless `cancel` fires first
async fn guarded<T, F>(cancel: &CancellationToken, work: F) -> Result<T, CallError>
where
    F: Future<Output = Result<Result<T, TransportError>, tokio::time::error::Elapsed>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        result = work => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Transport(e)),
            Err(_) => Err(CallError::Timeout),
        },
    }
}

/// Result of the most recent connect cycle
struct CycleRecord {
    generation: u64,
    outcome: Result<(), ConnectionError>,
}

/// One long-lived connection to one PLC
pub struct DeviceSession {
    endpoint: DeviceEndpoint,
    transport: Mutex<Box<dyn S7Transport>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Cancelled by `disconnect()`, then replaced for later operations
    cancel: SyncMutex<CancellationToken>,
    /// Held for a whole connect cycle, which makes connecting single-flight
    reconnect: Mutex<ReconnectHelper>,
    last_cycle: SyncMutex<CycleRecord>,
    stats: Arc<SyncMutex<ReconnectStats>>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("endpoint", &self.endpoint.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    pub fn new(endpoint: DeviceEndpoint, transport: Box<dyn S7Transport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let helper = ReconnectHelper::new(endpoint.id.clone(), endpoint.retry_policy());
        let stats = helper.stats_handle();
        Self {
            endpoint,
            transport: Mutex::new(transport),
            state_tx,
            cancel: SyncMutex::new(CancellationToken::new()),
            reconnect: Mutex::new(helper),
            last_cycle: SyncMutex::new(CycleRecord {
                generation: 0,
                outcome: Ok(()),
            }),
            stats,
        }
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats.lock().clone()
    }

    fn set_state(&self, new: ConnectionState, reason: &str) {
        let old = self.state_tx.send_replace(new);
        if old != new {
            info!("[STATUS] {} {} -> {} - {}", self.endpoint.id, old, new, reason);
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Establish the connection
    ///
    /// Up to `max_retries` attempts, each bounded by `connect_timeout_ms`,
    /// with `retry_interval_ms` between them. Callers arriving while another
    /// cycle runs wait for it and share its outcome.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let seen = self.cycle_generation();
        let helper = self.reconnect.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if let Some(outcome) = self.finished_since(seen) {
            return outcome;
        }
        self.set_state(ConnectionState::Connecting, "connect requested");
        self.run_connect_cycle(&helper).await
    }

    /// Drop the current connection and connect again
    ///
    /// Concurrent forced reconnects collapse into one cycle.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.reconnect_since(self.cycle_generation()).await
    }

    /// Forced reconnect on behalf of a caller that saw failures at
    /// generation `seen`
    ///
    /// When any connect cycle has completed since `seen`, the failures were
    /// against a connection that no longer exists: that cycle's outcome is
    /// returned and the current link is left alone.
    pub async fn reconnect_since(&self, seen: u64) -> Result<(), ConnectionError> {
        let helper = self.reconnect.lock().await;
        if let Some(outcome) = self.finished_since(seen) {
            return outcome;
        }
        if self.is_connected() {
            helper.mark_lost();
        }
        self.transport.lock().await.close().await;
        self.set_state(ConnectionState::Reconnecting, "forced reconnect");
        self.run_connect_cycle(&helper).await
    }

    /// Number of connect cycles completed so far
    pub fn cycle_generation(&self) -> u64 {
        self.last_cycle.lock().generation
    }

    /// Outcome of a cycle that completed after generation `seen`
    fn finished_since(&self, seen: u64) -> Option<Result<(), ConnectionError>> {
        let last = self.last_cycle.lock();
        (last.generation != seen).then(|| last.outcome.clone())
    }

    async fn run_connect_cycle(&self, helper: &ReconnectHelper) -> Result<(), ConnectionError> {
        let cancel = self.cancel_token();
        let target = self.endpoint.target();
        let timeout = self.endpoint.connect_timeout();

        let result = {
            let (cancel, target) = (&cancel, &target);
            helper
                .run(cancel, |_attempt| async move {
                    let work = async {
                        let mut transport = self.transport.lock().await;
                        tokio::time::timeout(timeout, transport.connect(target)).await
                    };
                    match guarded(cancel, work).await {
                        Ok(()) => Ok(()),
                        Err(CallError::Cancelled) => Err(ConnectionError::Cancelled),
                        Err(CallError::Timeout) => Err(ConnectionError::Timeout {
                            target: target.to_string(),
                            timeout,
                        }),
                        Err(CallError::Transport(e)) => Err(ConnectionError::Refused {
                            target: target.to_string(),
                            reason: e.to_string(),
                        }),
                    }
                })
                .await
        };

        let outcome = match result {
            Ok(attempt) => {
                self.set_state(
                    ConnectionState::Connected,
                    &format!("connected to {} on attempt {}", target, attempt),
                );
                Ok(())
            },
            Err(ReconnectError::Cancelled) => {
                self.set_state(ConnectionState::Disconnected, "connect cancelled");
                Err(ConnectionError::Cancelled)
            },
            Err(ReconnectError::MaxAttemptsExceeded {
                attempts,
                last_error,
            }) => {
                self.set_state(ConnectionState::Disconnected, "connect attempts exhausted");
                Err(ConnectionError::Exhausted {
                    target: target.to_string(),
                    attempts,
                    last_error,
                })
            },
        };

        let mut last = self.last_cycle.lock();
        last.generation += 1;
        last.outcome = outcome.clone();
        outcome
    }

    /// Close the connection
    ///
    /// Idempotent and safe from any state. In-flight reads, writes and
    /// connect cycles are released with a `Cancelled` error.
    pub async fn disconnect(&self) {
        let previous = {
            let mut cancel = self.cancel.lock();
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        previous.cancel();

        self.transport.lock().await.close().await;
        self.set_state(ConnectionState::Disconnected, "disconnect requested");
    }

    /// Record a lost connection detected outside a read/write call
    pub async fn mark_lost(&self, reason: &str) {
        if !self.is_connected() {
            return;
        }
        self.stats.lock().lost_connections += 1;
        self.transport.lock().await.close().await;
        self.set_state(ConnectionState::Disconnected, reason);
    }

    // ========================================================================
    // Batched I/O
    // ========================================================================

    /// Read a batch of addresses
    pub async fn read_batch(&self, addresses: &[String]) -> Result<RawSnapshot, ReadError> {
        if !self.is_connected() {
            return Err(ReadError::NotConnected);
        }
        let cancel = self.cancel_token();
        let timeout = self.endpoint.request_timeout();

        let work = async {
            let mut transport = self.transport.lock().await;
            tokio::time::timeout(timeout, transport.read_batch(addresses)).await
        };

        match guarded(&cancel, work).await {
            Ok(values) => Ok(RawSnapshot::from_reads(values)),
            Err(CallError::Cancelled) => Err(ReadError::Cancelled),
            Err(CallError::Timeout) => {
                debug!("{} read of {} addresses timed out", self.endpoint.id, addresses.len());
                Err(ReadError::Timeout(timeout))
            },
            Err(CallError::Transport(TransportError::NotConnected)) => {
                self.mark_lost("transport reports no connection").await;
                Err(ReadError::NotConnected)
            },
            Err(CallError::Transport(e)) => Err(ReadError::Transport(e.to_string())),
        }
    }

    /// Write a batch of address/value pairs
    pub async fn write_batch(&self, values: &[(String, PlcValue)]) -> Result<(), WriteError> {
        if !self.is_connected() {
            return Err(WriteError::NotConnected);
        }
        let cancel = self.cancel_token();
        let timeout = self.endpoint.request_timeout();

        let work = async {
            let mut transport = self.transport.lock().await;
            tokio::time::timeout(timeout, transport.write_batch(values)).await
        };

        match guarded(&cancel, work).await {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => Err(WriteError::Cancelled),
            Err(CallError::Timeout) => Err(WriteError::Timeout(timeout)),
            Err(CallError::Transport(TransportError::NotConnected)) => {
                self.mark_lost("transport reports no connection").await;
                Err(WriteError::NotConnected)
            },
            Err(CallError::Transport(e)) => Err(WriteError::Transport(e.to_string())),
        }
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    /// Probe the connection every `keep_alive_ms`
    ///
    /// A failed probe marks the session disconnected; schedulers watching
    /// the state reconnect without waiting for their next poll.
    pub fn spawn_keep_alive(
        self: &Arc<Self>,
        addresses: Vec<String>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let period = session.endpoint.keep_alive();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                if !session.is_connected() {
                    continue;
                }
                match session.read_batch(&addresses).await {
                    Ok(_) => debug!("{} keep-alive ok", session.endpoint.id),
                    Err(ReadError::NotConnected) | Err(ReadError::Cancelled) => {},
                    Err(e) => {
                        warn!("{} keep-alive failed: {}", session.endpoint.id, e);
                        session.mark_lost(&format!("keep-alive failed: {}", e)).await;
                    },
                }
            }
            debug!("{} keep-alive stopped", session.endpoint.id);
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::SimulatedPlc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn endpoint(max_retries: u32) -> DeviceEndpoint {
        DeviceEndpoint {
            id: "test-plc".to_string(),
            host: "127.0.0.1".to_string(),
            max_retries,
            retry_interval_ms: 100,
            connect_timeout_ms: 500,
            keep_alive_ms: 1000,
            ..Default::default()
        }
    }

    fn session(max_retries: u32) -> (Arc<DeviceSession>, SimulatedPlc) {
        let plc = SimulatedPlc::new();
        plc.set_value("DB101,B0", PlcValue::Int(1));
        let session = DeviceSession::new(endpoint(max_retries), Box::new(plc.clone()));
        (Arc::new(session), plc)
    }

    fn addresses() -> Vec<String> {
        vec!["DB101,B0".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_max_retries() {
        let (session, plc) = session(3);
        plc.fail_connects_always();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Exhausted { attempts: 3, .. }));
        assert_eq!(plc.connect_calls(), 3);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.stats().failed_connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let (session, plc) = session(3);
        plc.fail_connects(2);

        session.connect().await.unwrap();
        assert_eq!(plc.connect_calls(), 3);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(plc.last_target().unwrap().host, "127.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attempt_timeout_counts_as_failure() {
        let (session, plc) = session(2);
        plc.set_latency(Duration::from_secs(5));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Exhausted { attempts: 2, .. }));
        assert_eq!(plc.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(plc.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_cycle() {
        let (session, plc) = session(3);
        plc.fail_connects_always();

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.connect().await })
            })
            .collect();
        for caller in callers {
            let result = caller.await.unwrap();
            assert!(matches!(result, Err(ConnectionError::Exhausted { .. })));
        }
        assert_eq!(plc.connect_calls(), 3);

        // A later call starts a fresh cycle
        plc.heal();
        session.connect().await.unwrap();
        assert_eq!(plc.connect_calls(), 4);
    }

    #[tokio::test]
    async fn test_read_requires_connection() {
        let (session, plc) = session(3);
        let err = session.read_batch(&addresses()).await.unwrap_err();
        assert_eq!(err, ReadError::NotConnected);
        assert_eq!(plc.read_calls(), 0);
    }

    #[tokio::test]
    async fn test_read_and_write_batches() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();

        session
            .write_batch(&[("DB101,W10".to_string(), PlcValue::Int(15))])
            .await
            .unwrap();
        let snapshot = session
            .read_batch(&["DB101,B0".to_string(), "DB101,W10".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot.get("DB101,B0"), Some(PlcValue::Int(1)));
        assert_eq!(snapshot.get("DB101,W10"), Some(PlcValue::Int(15)));
        assert_eq!(plc.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();
        plc.fail_reads(1);

        let err = session.read_batch(&addresses()).await.unwrap_err();
        assert!(matches!(err, ReadError::Transport(_)));
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();
        plc.set_latency(Duration::from_secs(2));

        let err = session.read_batch(&addresses()).await.unwrap_err();
        assert_eq!(err, ReadError::Timeout(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_idempotent() {
        let (session, _plc) = session(3);
        session.connect().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_read() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();
        plc.set_latency(Duration::from_millis(400));

        let reader = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.read_batch(&addresses()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.disconnect().await;

        assert_eq!(reader.await.unwrap(), Err(ReadError::Cancelled));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_connect_cycle() {
        let (session, plc) = session(10);
        plc.fail_connects_always();

        let connector = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        session.disconnect().await;

        assert_eq!(connector.await.unwrap(), Err(ConnectionError::Cancelled));
        assert!(plc.connect_calls() < 10);
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let (session, _plc) = session(3);
        let mut rx = session.subscribe_state();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);

        session.connect().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_status_transitions_are_logged() {
        let (session, _plc) = session(3);
        session.connect().await.unwrap();
        session.disconnect().await;

        assert!(logs_contain("[STATUS] test-plc DISCONNECTED -> CONNECTING"));
        assert!(logs_contain("CONNECTING -> CONNECTED"));
        assert!(logs_contain("CONNECTED -> DISCONNECTED - disconnect requested"));
    }

    #[tokio::test]
    async fn test_forced_reconnect_counts_lost_connection() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();

        session.reconnect().await.unwrap();
        assert_eq!(plc.connect_calls(), 2);
        assert_eq!(plc.close_calls(), 1);
        assert_eq!(session.stats().lost_connections, 1);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_stale_forced_reconnects_reuse_latest_cycle() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();
        let seen = session.cycle_generation();

        // Four pollers saw failures on the same link; the first reconnect
        // replaces it and the others find it already replaced
        for _ in 0..4 {
            session.reconnect_since(seen).await.unwrap();
        }
        assert_eq!(plc.connect_calls(), 2);
        assert_eq!(session.stats().lost_connections, 1);
        assert_eq!(session.cycle_generation(), seen + 1);
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_detects_dropped_link() {
        let (session, plc) = session(3);
        session.connect().await.unwrap();
        let mut rx = session.subscribe_state();
        rx.borrow_and_update();

        let shutdown = CancellationToken::new();
        let handle = session.spawn_keep_alive(addresses(), shutdown.clone());

        plc.fail_reads_always();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(session.stats().lost_connections, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
