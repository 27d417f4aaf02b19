//! In-memory S7 transport
//!
//! Holds a flat address -> value memory and answers batched reads and
//! writes from it. Faults (failing connects/reads/writes, latency, dropped
//! connections, unreadable addresses) can be injected through any clone of
//! the handle, which makes it both the offline runtime driver and the test
//! double for the session and scheduler.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{ConnectTarget, S7Transport};
use crate::catalog::{Catalog, DeviceKind};
use crate::error::TransportError;
use crate::value::PlcValue;

const MAX_AISLE: i64 = 12;
const MAX_HEIGHT: i64 = 59;
const MAX_REGISTRATION: i64 = 30000;

/// How often an injected fault fires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Fault {
    #[default]
    Never,
    Times(u32),
    Always,
}

impl Fault {
    /// Consume one occurrence, returning whether the fault fires now
    fn trip(&mut self) -> bool {
        match *self {
            Fault::Never => false,
            Fault::Always => true,
            Fault::Times(0) => {
                *self = Fault::Never;
                false
            },
            Fault::Times(n) => {
                *self = if n == 1 {
                    Fault::Never
                } else {
                    Fault::Times(n - 1)
                };
                true
            },
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    memory: HashMap<String, PlcValue>,
    unreadable: HashSet<String>,
    connected: bool,
    connect_fault: Fault,
    read_fault: Fault,
    write_fault: Fault,
    latency: Duration,
    connect_calls: u32,
    read_calls: u32,
    write_calls: u32,
    close_calls: u32,
    last_target: Option<ConnectTarget>,
    written: Vec<(String, PlcValue)>,
}

/// Simulated PLC, cheap to clone; all clones share one memory
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlc {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }

    /// A PLC whose memory holds the catalog's seed values for every device
    pub fn seeded(catalog: &Catalog) -> Self {
        let plc = Self::new();
        for device in catalog.devices() {
            plc.load(catalog.simulated_values(device.id.as_str()));
        }
        plc
    }

    pub fn load<I>(&self, values: I)
    where
        I: IntoIterator<Item = (String, PlcValue)>,
    {
        self.state.lock().memory.extend(values);
    }

    pub fn set_value(&self, address: &str, value: impl Into<PlcValue>) {
        self.state
            .lock()
            .memory
            .insert(address.to_string(), value.into());
    }

    pub fn value(&self, address: &str) -> Option<PlcValue> {
        self.state.lock().memory.get(address).copied()
    }

    /// Make an address come back as null on reads
    pub fn set_unreadable(&self, address: &str) {
        self.state.lock().unreadable.insert(address.to_string());
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    pub fn fail_connects(&self, times: u32) {
        self.state.lock().connect_fault = Fault::Times(times);
    }

    pub fn fail_connects_always(&self) {
        self.state.lock().connect_fault = Fault::Always;
    }

    pub fn fail_reads(&self, times: u32) {
        self.state.lock().read_fault = Fault::Times(times);
    }

    pub fn fail_reads_always(&self) {
        self.state.lock().read_fault = Fault::Always;
    }

    pub fn fail_writes(&self, times: u32) {
        self.state.lock().write_fault = Fault::Times(times);
    }

    /// Clear every injected fault
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.connect_fault = Fault::Never;
        state.read_fault = Fault::Never;
        state.write_fault = Fault::Never;
    }

    /// Drop the link as if the cable was pulled; reads fail until reconnect
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    /// Delay applied to every connect/read/write
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    pub fn read_calls(&self) -> u32 {
        self.state.lock().read_calls
    }

    pub fn write_calls(&self) -> u32 {
        self.state.lock().write_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    pub fn last_target(&self) -> Option<ConnectTarget> {
        self.state.lock().last_target.clone()
    }

    /// Every value written so far, in order
    pub fn written(&self) -> Vec<(String, PlcValue)> {
        self.state.lock().written.clone()
    }

    // ------------------------------------------------------------------------
    // Motion simulation
    // ------------------------------------------------------------------------

    /// Advance the simulated cranes by one random step
    ///
    /// Positions wander by at most one unit, occupancy and mode flip rarely,
    /// and an idle crane occasionally receives a new order.
    pub fn step(&self, catalog: &Catalog) {
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock();

        let cranes = catalog
            .devices()
            .filter(|d| d.kind == DeviceKind::StackerCrane);
        for crane in cranes {
            let id = crane.id.as_str();
            let addr = |field: &str| catalog.field(id, field).ok().map(|s| (s.address.clone(), s.kind));
            let mut nudge = |field: &str, chance: f64, min: i64, max: i64| {
                if let Some((address, kind)) = addr(field) {
                    if rng.gen_bool(chance) {
                        let current = state.memory.get(&address).map_or(min, |v| v.as_i64());
                        let next = (current + rng.gen_range(-1..=1)).clamp(min, max);
                        state.memory.insert(address, kind.coerce(next));
                    }
                }
            };

            nudge("COORD_X", 0.3, 1, MAX_HEIGHT);
            nudge("COORD_Y", 0.2, 1, MAX_HEIGHT);
            nudge("PASILLO", 0.05, 1, MAX_AISLE);
            nudge("OCUPACION", 0.1, 0, 1);
            nudge("MODO", 0.02, 0, 2);

            if let Some((address, kind)) = addr("MATRICULA") {
                if rng.gen_bool(0.02) {
                    let registration = rng.gen_range(0..MAX_REGISTRATION);
                    state.memory.insert(address, kind.coerce(registration));
                }
            }

            let idle = addr("ORDEN.TIPO")
                .and_then(|(a, _)| state.memory.get(&a).copied())
                .map_or(true, |v| v.as_i64() == 0);
            if idle && rng.gen_bool(0.05) {
                let order = [
                    ("ORDEN.TIPO", rng.gen_range(1..=5)),
                    ("ORIGEN.PASILLO", rng.gen_range(1..=MAX_AISLE)),
                    ("ORIGEN.X", rng.gen_range(1..=MAX_HEIGHT)),
                    ("ORIGEN.Y", rng.gen_range(1..=MAX_HEIGHT)),
                    ("ORIGEN.Z", rng.gen_range(1..=2)),
                    ("DESTINO.PASILLO", rng.gen_range(1..=MAX_AISLE)),
                    ("DESTINO.X", rng.gen_range(1..=MAX_HEIGHT)),
                    ("DESTINO.Y", rng.gen_range(1..=MAX_HEIGHT)),
                    ("DESTINO.Z", rng.gen_range(1..=2)),
                    ("ORDEN.MATRICULA", rng.gen_range(0..MAX_REGISTRATION)),
                    ("FIN_ORDEN.ESTADO", 1),
                ];
                for (field, value) in order {
                    if let Some((address, kind)) = addr(field) {
                        state.memory.insert(address, kind.coerce(value));
                    }
                }
            }
        }
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }
}

#[async_trait]
impl S7Transport for SimulatedPlc {
    async fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError> {
        self.state.lock().connect_calls += 1;
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.last_target = Some(target.clone());
        if state.connect_fault.trip() {
            state.connected = false;
            return Err(TransportError::Refused(format!(
                "simulated refusal from {}",
                target
            )));
        }
        state.connected = true;
        trace!("Simulated PLC connected to {}", target);
        Ok(())
    }

    async fn read_batch(
        &mut self,
        addresses: &[String],
    ) -> Result<Vec<(String, Option<PlcValue>)>, TransportError> {
        self.state.lock().read_calls += 1;
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.read_fault.trip() {
            return Err(TransportError::Io("simulated read failure".to_string()));
        }
        Ok(addresses
            .iter()
            .map(|a| {
                let value = if state.unreadable.contains(a) {
                    None
                } else {
                    state.memory.get(a).copied()
                };
                (a.clone(), value)
            })
            .collect())
    }

    async fn write_batch(&mut self, values: &[(String, PlcValue)]) -> Result<(), TransportError> {
        self.state.lock().write_calls += 1;
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.write_fault.trip() {
            return Err(TransportError::Io("simulated write failure".to_string()));
        }
        for (address, value) in values {
            state.memory.insert(address.clone(), *value);
            state.written.push((address.clone(), *value));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.connected = false;
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
