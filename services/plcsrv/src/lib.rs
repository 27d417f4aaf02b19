//! PLC polling and reconnection core (`plcsrv`)
//!
//! Keeps one long-lived connection to the warehouse S7-400, polls the
//! stacker cranes (TLV1, TLV2), the transfer cart and the transfer bridge on
//! their own cadence, turns raw `DB<n>,<offset>` values into typed records and
//! publishes them to subscribers. Operator commands go back out through the
//! same connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ PollScheduler│──►│ DeviceSession  │──►│ S7Transport  │
//! │ (per device) │   │ (per endpoint) │   │ (driver/sim) │
//! └──────┬───────┘   └────────────────┘   └──────────────┘
//!        │ translate           ▲
//!        ▼                     │
//! ┌──────────────┐   ┌────────────────┐
//! │ Broadcaster  │   │ CommandService │
//! │ latest + feed│   │ validate+write │
//! └──────────────┘   └────────────────┘
//! ```
//!
//! - **`catalog`**: symbol <-> address table and enum decoding
//! - **`session`**: connection state, retries, keep-alive, batched I/O
//! - **`runtime`**: schedulers, reconnection policy, lifecycle
//! - **`translator`**: raw snapshot -> [`translator::DomainRecord`]
//! - **`broadcaster`**: latest record per device and subscriptions
//! - **`commands`**: position, order and mode writes

pub mod bootstrap;
pub mod broadcaster;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod runtime;
pub mod session;
pub mod translator;
pub mod transport;
pub mod value;

pub use broadcaster::{Latest, Update, UpdateBroadcaster};
pub use catalog::Catalog;
pub use commands::{CommandService, OrderCommand, PositionCommand};
pub use config::PlcConfig;
pub use error::{PlcError, Result};
pub use runtime::PlcRuntime;
pub use session::{ConnectionState, DeviceSession};
pub use translator::DomainRecord;
pub use value::{DeviceId, PlcValue, RawSnapshot};
