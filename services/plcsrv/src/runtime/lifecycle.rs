//! Runtime lifecycle management
//!
//! Wires sessions, schedulers, keep-alives, the broadcaster and the command
//! service together, and tears them down again on shutdown.

use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scheduler::{PollScheduler, SchedulerStats};
use crate::broadcaster::UpdateBroadcaster;
use crate::catalog::Catalog;
use crate::commands::CommandService;
use crate::config::PlcConfig;
use crate::error::{PlcError, Result};
use crate::session::DeviceSession;
use crate::transport::TransportFactory;
use crate::value::DeviceId;

/// A running polling core
pub struct PlcRuntime {
    catalog: Arc<Catalog>,
    /// Keyed by endpoint id
    sessions: HashMap<String, Arc<DeviceSession>>,
    broadcaster: Arc<UpdateBroadcaster>,
    commands: Arc<CommandService>,
    shutdown: CancellationToken,
    schedulers: Vec<(DeviceId, JoinHandle<SchedulerStats>)>,
    keep_alives: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for PlcRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcRuntime")
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("schedulers", &self.schedulers.len())
            .finish()
    }
}

impl PlcRuntime {
    /// Start the polling core
    ///
    /// Creates one session per endpoint and connects them concurrently.
    /// Connect failures are logged and left to the schedulers to retry;
    /// only an invalid configuration fails startup.
    pub async fn start(
        config: &PlcConfig,
        catalog: Arc<Catalog>,
        factory: &dyn TransportFactory,
    ) -> Result<Self> {
        config.validate(&catalog)?;
        let shutdown = CancellationToken::new();

        // Phase 1: one session per endpoint
        let sessions: HashMap<String, Arc<DeviceSession>> = config
            .endpoints
            .iter()
            .map(|endpoint| {
                let transport = factory.create(&endpoint.id);
                info!(
                    "Endpoint {} at {} via {} transport",
                    endpoint.id,
                    endpoint.target(),
                    transport.name()
                );
                (
                    endpoint.id.clone(),
                    Arc::new(DeviceSession::new(endpoint.clone(), transport)),
                )
            })
            .collect();

        // Phase 2: connect every endpoint concurrently
        let results = join_all(sessions.values().map(|session| async move {
            (session.endpoint().id.clone(), session.connect().await)
        }))
        .await;
        let mut connected = 0;
        for (id, result) in results {
            match result {
                Ok(()) => connected += 1,
                Err(e) => error!("Initial connect of {} failed: {}", id, e),
            }
        }
        info!("{}/{} endpoints connected", connected, sessions.len());

        // Phase 3: keep-alive per endpoint over the addresses of its devices
        let mut keep_alives = Vec::with_capacity(sessions.len());
        for (endpoint_id, session) in &sessions {
            let addresses: BTreeSet<String> = config
                .devices
                .iter()
                .filter(|d| &d.endpoint == endpoint_id)
                .flat_map(|d| catalog.addresses_for_device(d.id.as_str()))
                .collect();
            if addresses.is_empty() {
                warn!("Endpoint {} has no monitored devices", endpoint_id);
                continue;
            }
            keep_alives.push(
                session.spawn_keep_alive(addresses.into_iter().collect(), shutdown.child_token()),
            );
        }

        // Phase 4: one scheduler per device
        let broadcaster = Arc::new(UpdateBroadcaster::new(config.broadcaster.queue_capacity));
        let mut schedulers = Vec::with_capacity(config.devices.len());
        let mut device_sessions = HashMap::with_capacity(config.devices.len());
        for device in &config.devices {
            let session = sessions.get(&device.endpoint).ok_or_else(|| {
                PlcError::config(format!(
                    "Device {} references unknown endpoint {}",
                    device.id, device.endpoint
                ))
            })?;
            let cycle = config.device_cycle(device).ok_or_else(|| {
                PlcError::config(format!("Device {} has no poll cycle", device.id))
            })?;

            let scheduler = PollScheduler::new(
                device.id.clone(),
                Arc::clone(session),
                Arc::clone(&catalog),
                Arc::clone(&broadcaster),
                cycle,
                &config.scheduler,
            )?;
            schedulers.push((
                device.id.clone(),
                tokio::spawn(scheduler.run(shutdown.child_token())),
            ));
            device_sessions.insert(device.id.clone(), Arc::clone(session));
        }

        let commands = Arc::new(CommandService::new(
            Arc::clone(&catalog),
            device_sessions,
            config.commands.verify_writes,
        ));

        info!(
            "PLC runtime started: {} endpoints, {} devices",
            sessions.len(),
            schedulers.len()
        );

        Ok(Self {
            catalog,
            sessions,
            broadcaster,
            commands,
            shutdown,
            schedulers,
            keep_alives,
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn broadcaster(&self) -> &Arc<UpdateBroadcaster> {
        &self.broadcaster
    }

    pub fn commands(&self) -> &Arc<CommandService> {
        &self.commands
    }

    pub fn session(&self, endpoint_id: &str) -> Option<&Arc<DeviceSession>> {
        self.sessions.get(endpoint_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<DeviceSession>> {
        self.sessions.values()
    }

    /// Token cancelled when the runtime shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every task, then disconnect every session
    pub async fn shutdown(self) -> HashMap<DeviceId, SchedulerStats> {
        info!("Shutting down PLC runtime");
        self.shutdown.cancel();

        let mut stats = HashMap::with_capacity(self.schedulers.len());
        for (device, handle) in self.schedulers {
            match handle.await {
                Ok(device_stats) => {
                    debug!(
                        "{} stopped after {} polls ({} published, {} failed)",
                        device,
                        device_stats.polls,
                        device_stats.published,
                        device_stats.failed_polls
                    );
                    stats.insert(device, device_stats);
                },
                Err(e) => error!("Scheduler of {} ended abnormally: {}", device, e),
            }
        }
        for handle in self.keep_alives {
            if let Err(e) = handle.await {
                error!("Keep-alive task ended abnormally: {}", e);
            }
        }

        join_all(self.sessions.values().map(|session| session.disconnect())).await;
        self.broadcaster.close();
        info!("PLC runtime stopped");
        stats
    }
}
