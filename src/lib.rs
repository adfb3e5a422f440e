//! mtlink - async websocket RPC client core for the MetaTrader gateway.
//!
//! One event-oriented socket multiplexes request/response RPCs for many
//! logical accounts and carries an out-of-order stream of
//! state-synchronization events. This crate owns the hard parts of that
//! interaction: connection lifecycle and reconnection, request correlation
//! and timeouts, error demultiplexing, timestamp normalization, per-account
//! packet reordering, listener fan-out, and health/uptime derivation.
//!
//! Trading domain payloads (positions, orders, deals, prices) stay opaque
//! [`serde_json::Value`]s; storage and trade-strategy logic belong to the
//! host application.

// Library modules
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod sync;
pub mod time;

// Re-export commonly used types
pub use client::{ConnectionState, GatewayClient};
pub use config::{ClientOptions, ClientOptionsBuilder};
pub use error::GatewayError;
pub use protocol::{Deals, HistoryOrders, ProcessingError, SocketEvent, SyncPacket, TradeResponse};
pub use sync::{
    ConnectionHealthStatus, HealthMonitor, OutOfOrderReport, PacketOrderer, QuoteSession,
    ReconnectListener, StatisticalReservoir, Statistics, SymbolSpecification, SyncDispatcher,
    SyncListener, TerminalState,
};
pub use time::{instant, normalize_time_fields};
