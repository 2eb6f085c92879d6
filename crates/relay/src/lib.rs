//! Relay runtime: syncs the ledger, filters and decodes runtime notifications
//! of one program and fans them out to WebSocket subscribers.
//!
//! `main.rs` wires these pieces to environment configuration; embedders can
//! call [`RelayHandle::start`] with their own [`Ledger`] implementation.
//!
//! [`Ledger`]: notify_relay_domain::Ledger

pub mod acceptor;
pub mod broadcast;
pub mod pipeline;
pub mod registry;
pub mod rpc;
pub mod worker;

pub use acceptor::{AcceptError, ConnectionAcceptor};
pub use broadcast::{BroadcastReport, Broadcaster};
pub use pipeline::{forward_event, run_dispatcher, NotificationListener};
pub use registry::{DeliveryError, MessageSink, Subscriber, SubscriberId, SubscriberRegistry};
pub use rpc::{HttpNodeClient, NodeClient, RpcLedger};
pub use worker::{run_heartbeat, run_relay, run_sync_driver, RelayError, RelayHandle};
