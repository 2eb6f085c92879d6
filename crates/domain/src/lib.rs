//! Domain-level building blocks shared by the relay and storage crates.
//!
//! Holds the notification payload model and its decoder, the ledger trait
//! seams the relay drives, and the environment configuration. Telemetry
//! bootstrap for binaries lives in `services`.

pub mod config;
pub mod decode;
pub mod ledger;
pub mod model;
pub mod services;

pub use decode::{decode, DecodeError, ShapeError};
pub use ledger::{Ledger, LedgerError, LedgerStateStore, NotifyHandler, StorageError};
pub use model::{
    DecodedEvent, NotificationEvent, PayloadValue, ProgramId, RelayMessage, StackInteger,
};
