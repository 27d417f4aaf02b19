//! S7 transport abstraction
//!
//! The S7 wire protocol lives in an external driver. The session only needs
//! connect / batched read / batched write, expressed here as an async trait
//! so a real driver and the in-memory [`SimulatedPlc`] are interchangeable.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransportError;
use crate::value::PlcValue;

pub use simulated::SimulatedPlc;

/// Where a transport should connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (rack {}, slot {})",
            self.host, self.port, self.rack, self.slot
        )
    }
}

/// Driver for one physical PLC connection
///
/// Implementations are owned exclusively by a
/// [`DeviceSession`](crate::session::DeviceSession), which serializes every
/// call, so `&mut self` is enough.
#[async_trait]
pub trait S7Transport: Send + Sync {
    /// Open the connection
    async fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError>;

    /// Read a batch of absolute addresses
    ///
    /// Returns one entry per requested address; `None` marks a value the PLC
    /// did not deliver.
    async fn read_batch(
        &mut self,
        addresses: &[String],
    ) -> Result<Vec<(String, Option<PlcValue>)>, TransportError>;

    /// Write a batch of address/value pairs
    async fn write_batch(&mut self, values: &[(String, PlcValue)]) -> Result<(), TransportError>;

    /// Release the connection; must be safe to call when not connected
    async fn close(&mut self);

    /// Driver name for logs
    fn name(&self) -> &str;
}

/// Creates a transport for an endpoint at runtime start
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint_id: &str) -> Box<dyn S7Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Box<dyn S7Transport> + Send + Sync,
{
    fn create(&self, endpoint_id: &str) -> Box<dyn S7Transport> {
        self(endpoint_id)
    }
}
