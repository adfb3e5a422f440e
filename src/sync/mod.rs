//! Synchronization event pipeline.
//!
//! Inbound `synchronization` packets flow through this module after
//! timestamp normalization:
//!
//! ```text
//! socket ──► PacketOrderer ──► SyncDispatcher ──► SyncListener callbacks
//!                 │                                      │
//!                 └── gap reports (host re-subscribes)   └── HealthMonitor
//! ```
//!
//! Listeners are capability sets: [`SyncListener`] has a default no-op
//! implementation for every event, so consumers override only the events
//! they care about. Listener failures never propagate into the pipeline —
//! the dispatcher logs and moves on.

pub mod dispatcher;
pub mod health;
pub mod orderer;
pub mod reservoir;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-account consumer of synchronization events.
///
/// Every method has a no-op default; implement only the capabilities you
/// need. Returned errors are logged by the dispatcher with the account id
/// and event name, and never stall the stream.
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// Connection to the trading terminal established.
    async fn on_connected(&self) -> Result<()> {
        Ok(())
    }

    /// Connection to the trading terminal lost.
    async fn on_disconnected(&self) -> Result<()> {
        Ok(())
    }

    /// A new state-synchronization round started.
    async fn on_synchronization_started(&self) -> Result<()> {
        Ok(())
    }

    /// Account information replaced.
    async fn on_account_information_updated(&self, _account_information: &Value) -> Result<()> {
        Ok(())
    }

    /// A deal was added to history.
    async fn on_deal_added(&self, _deal: &Value) -> Result<()> {
        Ok(())
    }

    /// Pending order list replaced wholesale.
    async fn on_orders_replaced(&self, _orders: &[Value]) -> Result<()> {
        Ok(())
    }

    /// A pending order changed.
    async fn on_order_updated(&self, _order: &Value) -> Result<()> {
        Ok(())
    }

    /// A pending order completed (executed or canceled).
    async fn on_order_completed(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }

    /// A history order was added.
    async fn on_history_order_added(&self, _history_order: &Value) -> Result<()> {
        Ok(())
    }

    /// Open position list replaced wholesale.
    async fn on_positions_replaced(&self, _positions: &[Value]) -> Result<()> {
        Ok(())
    }

    /// An open position changed.
    async fn on_position_updated(&self, _position: &Value) -> Result<()> {
        Ok(())
    }

    /// An open position was removed.
    async fn on_position_removed(&self, _position_id: &str) -> Result<()> {
        Ok(())
    }

    /// Deal history synchronization finished.
    async fn on_deal_synchronization_finished(&self, _synchronization_id: &str) -> Result<()> {
        Ok(())
    }

    /// Order history synchronization finished.
    async fn on_order_synchronization_finished(&self, _synchronization_id: &str) -> Result<()> {
        Ok(())
    }

    /// Broker-side connection status changed.
    async fn on_broker_connection_status_changed(&self, _connected: bool) -> Result<()> {
        Ok(())
    }

    /// A symbol specification was updated.
    async fn on_symbol_specification_updated(&self, _specification: &Value) -> Result<()> {
        Ok(())
    }

    /// A symbol price was updated.
    async fn on_symbol_price_updated(&self, _price: &Value) -> Result<()> {
        Ok(())
    }
}

/// Consumer notified when the socket reconnects after a drop.
#[async_trait]
pub trait ReconnectListener: Send + Sync {
    /// The socket re-established its connection.
    async fn on_reconnected(&self) -> Result<()>;
}

/// One quote session window on a weekday, broker time.
///
/// `from`/`to` are `HH:mm:ss.SSS` strings; comparison is lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSession {
    /// Session start, inclusive.
    pub from: String,
    /// Session end, inclusive.
    pub to: String,
}

/// The slice of a symbol specification the health monitor consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSpecification {
    /// Quote sessions keyed by uppercase weekday name (`SUNDAY`..`SATURDAY`).
    #[serde(default)]
    pub quote_sessions: HashMap<String, Vec<QuoteSession>>,
}

/// Read-only view of the local terminal state mirror.
///
/// The terminal state itself is maintained by an external collaborator; this
/// core only reads it when deriving health.
pub trait TerminalState: Send + Sync {
    /// Whether the API connection is established.
    fn connected(&self) -> bool;

    /// Whether the terminal is connected to the broker.
    fn connected_to_broker(&self) -> bool;

    /// Whether the local state is synchronized to the broker.
    fn synchronized(&self) -> bool;

    /// Symbols with an active market-data subscription.
    fn subscribed_symbols(&self) -> Vec<String>;

    /// Specification of a subscribed symbol, when known.
    fn specification(&self, symbol: &str) -> Option<SymbolSpecification>;
}

// Re-exports
pub use dispatcher::SyncDispatcher;
pub use health::{ConnectionHealthStatus, HealthMonitor, DEFAULT_MIN_QUOTE_INTERVAL};
pub use orderer::{OutOfOrderReport, PacketOrderer, DEFAULT_GAP_TIMEOUT};
pub use reservoir::{StatisticalReservoir, Statistics};
