//! Synchronization packet fan-out.
//!
//! Maps each reordered packet type to the matching [`SyncListener`]
//! capability calls on the packet's account. Dispatch is sequential within a
//! packet (the per-type call order below is part of the contract) and the
//! caller serializes packets per account, so listeners observe events in
//! sequence order.
//!
//! A misbehaving listener must not stall the stream: failures are logged
//! with the account id and event name and swallowed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::SyncListener;
use crate::protocol::SyncPacket;

/// Registry of per-account listeners and the packet → callback mapping.
pub struct SyncDispatcher {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn SyncListener>>>>,
}

impl std::fmt::Debug for SyncDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let accounts = self.listeners.read().expect("listener lock poisoned").len();
        f.debug_struct("SyncDispatcher")
            .field("accounts", &accounts)
            .finish_non_exhaustive()
    }
}

impl Default for SyncDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener for an account. Listeners are invoked in
    /// insertion order.
    pub fn add_listener(&self, account_id: &str, listener: Arc<dyn SyncListener>) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .entry(account_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove one listener by identity.
    pub fn remove_listener(&self, account_id: &str, listener: &Arc<dyn SyncListener>) {
        if let Some(list) = self
            .listeners
            .write()
            .expect("listener lock poisoned")
            .get_mut(account_id)
        {
            list.retain(|registered| !Arc::ptr_eq(registered, listener));
        }
    }

    /// Drop every listener registered for an account.
    pub fn remove_listeners(&self, account_id: &str) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .remove(account_id);
    }

    /// Drop all listeners for all accounts.
    pub fn clear(&self) {
        self.listeners.write().expect("listener lock poisoned").clear();
    }

    /// Number of listeners registered for an account.
    #[must_use]
    pub fn listener_count(&self, account_id: &str) -> usize {
        self.listeners
            .read()
            .expect("listener lock poisoned")
            .get(account_id)
            .map_or(0, Vec::len)
    }

    /// Fan a packet out to the account's listeners.
    pub async fn dispatch(&self, packet: &SyncPacket) {
        // Snapshot so add/remove during dispatch cannot shift the iteration.
        let listeners: Vec<Arc<dyn SyncListener>> = {
            self.listeners
                .read()
                .expect("listener lock poisoned")
                .get(&packet.account_id)
                .cloned()
                .unwrap_or_default()
        };
        if listeners.is_empty() {
            return;
        }

        for listener in &listeners {
            self.dispatch_to(listener.as_ref(), packet).await;
        }
    }

    async fn dispatch_to(&self, listener: &dyn SyncListener, packet: &SyncPacket) {
        let account = packet.account_id.as_str();
        match packet.packet_type.as_str() {
            "authenticated" => {
                log_failure(account, "on_connected", listener.on_connected().await);
            }
            "disconnected" => {
                log_failure(account, "on_disconnected", listener.on_disconnected().await);
            }
            "synchronizationStarted" => {
                log_failure(
                    account,
                    "on_synchronization_started",
                    listener.on_synchronization_started().await,
                );
            }
            "accountInformation" => {
                if let Some(info) = packet.field("accountInformation") {
                    log_failure(
                        account,
                        "on_account_information_updated",
                        listener.on_account_information_updated(info).await,
                    );
                }
            }
            "deals" => {
                for deal in packet.array_field("deals") {
                    log_failure(account, "on_deal_added", listener.on_deal_added(deal).await);
                }
            }
            "orders" => {
                log_failure(
                    account,
                    "on_orders_replaced",
                    listener.on_orders_replaced(packet.array_field("orders")).await,
                );
            }
            "historyOrders" => {
                for order in packet.array_field("historyOrders") {
                    log_failure(
                        account,
                        "on_history_order_added",
                        listener.on_history_order_added(order).await,
                    );
                }
            }
            "positions" => {
                log_failure(
                    account,
                    "on_positions_replaced",
                    listener
                        .on_positions_replaced(packet.array_field("positions"))
                        .await,
                );
            }
            "update" => {
                self.dispatch_update(listener, packet).await;
            }
            "dealSynchronizationFinished" => {
                log_failure(
                    account,
                    "on_deal_synchronization_finished",
                    listener
                        .on_deal_synchronization_finished(string_field(packet, "synchronizationId"))
                        .await,
                );
            }
            "orderSynchronizationFinished" => {
                log_failure(
                    account,
                    "on_order_synchronization_finished",
                    listener
                        .on_order_synchronization_finished(string_field(packet, "synchronizationId"))
                        .await,
                );
            }
            "status" => {
                let connected = packet
                    .field("connected")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                log_failure(
                    account,
                    "on_broker_connection_status_changed",
                    listener.on_broker_connection_status_changed(connected).await,
                );
            }
            "specifications" => {
                for specification in packet.array_field("specifications") {
                    log_failure(
                        account,
                        "on_symbol_specification_updated",
                        listener.on_symbol_specification_updated(specification).await,
                    );
                }
            }
            "prices" => {
                for price in packet.array_field("prices") {
                    log_failure(
                        account,
                        "on_symbol_price_updated",
                        listener.on_symbol_price_updated(price).await,
                    );
                }
            }
            other => {
                log::debug!("ignoring unknown synchronization packet type {other} for {account}");
            }
        }
    }

    /// An `update` packet carries deltas of several kinds; the call order
    /// below is fixed.
    async fn dispatch_update(&self, listener: &dyn SyncListener, packet: &SyncPacket) {
        let account = packet.account_id.as_str();

        if let Some(info) = packet.field("accountInformation") {
            log_failure(
                account,
                "on_account_information_updated",
                listener.on_account_information_updated(info).await,
            );
        }
        for position in packet.array_field("updatedPositions") {
            log_failure(
                account,
                "on_position_updated",
                listener.on_position_updated(position).await,
            );
        }
        for position_id in packet.array_field("removedPositionIds") {
            if let Some(id) = position_id.as_str() {
                log_failure(
                    account,
                    "on_position_removed",
                    listener.on_position_removed(id).await,
                );
            }
        }
        for order in packet.array_field("updatedOrders") {
            log_failure(account, "on_order_updated", listener.on_order_updated(order).await);
        }
        for order_id in packet.array_field("completedOrderIds") {
            if let Some(id) = order_id.as_str() {
                log_failure(
                    account,
                    "on_order_completed",
                    listener.on_order_completed(id).await,
                );
            }
        }
        for order in packet.array_field("historyOrders") {
            log_failure(
                account,
                "on_history_order_added",
                listener.on_history_order_added(order).await,
            );
        }
        for deal in packet.array_field("deals") {
            log_failure(account, "on_deal_added", listener.on_deal_added(deal).await);
        }
    }
}

fn string_field<'a>(packet: &'a SyncPacket, name: &str) -> &'a str {
    packet.field(name).and_then(Value::as_str).unwrap_or_default()
}

fn log_failure(account_id: &str, event: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        log::error!("listener failed for account {account_id} on {event}: {e:#}");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every callback invocation as a descriptive string.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncListener for Recorder {
        async fn on_connected(&self) -> anyhow::Result<()> {
            self.push("connected");
            Ok(())
        }

        async fn on_disconnected(&self) -> anyhow::Result<()> {
            self.push("disconnected");
            Ok(())
        }

        async fn on_account_information_updated(&self, info: &Value) -> anyhow::Result<()> {
            self.push(format!("account_information:{}", info["balance"]));
            Ok(())
        }

        async fn on_deal_added(&self, deal: &Value) -> anyhow::Result<()> {
            self.push(format!("deal:{}", deal["id"]));
            Ok(())
        }

        async fn on_orders_replaced(&self, orders: &[Value]) -> anyhow::Result<()> {
            self.push(format!("orders_replaced:{}", orders.len()));
            Ok(())
        }

        async fn on_order_updated(&self, order: &Value) -> anyhow::Result<()> {
            self.push(format!("order_updated:{}", order["id"]));
            Ok(())
        }

        async fn on_order_completed(&self, order_id: &str) -> anyhow::Result<()> {
            self.push(format!("order_completed:{order_id}"));
            Ok(())
        }

        async fn on_history_order_added(&self, order: &Value) -> anyhow::Result<()> {
            self.push(format!("history_order:{}", order["id"]));
            Ok(())
        }

        async fn on_positions_replaced(&self, positions: &[Value]) -> anyhow::Result<()> {
            self.push(format!("positions_replaced:{}", positions.len()));
            Ok(())
        }

        async fn on_position_updated(&self, position: &Value) -> anyhow::Result<()> {
            self.push(format!("position_updated:{}", position["id"]));
            Ok(())
        }

        async fn on_position_removed(&self, position_id: &str) -> anyhow::Result<()> {
            self.push(format!("position_removed:{position_id}"));
            Ok(())
        }

        async fn on_broker_connection_status_changed(&self, connected: bool) -> anyhow::Result<()> {
            self.push(format!("status:{connected}"));
            Ok(())
        }

        async fn on_deal_synchronization_finished(&self, sync_id: &str) -> anyhow::Result<()> {
            self.push(format!("deal_sync_finished:{sync_id}"));
            Ok(())
        }

        async fn on_symbol_price_updated(&self, price: &Value) -> anyhow::Result<()> {
            self.push(format!("price:{}", price["symbol"].as_str().unwrap_or("?")));
            Ok(())
        }
    }

    /// Fails every callback it implements.
    struct Exploder;

    #[async_trait]
    impl SyncListener for Exploder {
        async fn on_connected(&self) -> anyhow::Result<()> {
            Err(anyhow!("listener exploded"))
        }
    }

    fn packet(value: Value) -> SyncPacket {
        serde_json::from_value(value).unwrap()
    }

    // ── Basic fan-out ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_authenticated_dispatches_on_connected() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({"type": "authenticated", "accountId": "acc"})))
            .await;

        assert_eq!(recorder.events(), vec!["connected"]);
    }

    #[tokio::test]
    async fn test_per_item_fan_out() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({
                "type": "deals",
                "accountId": "acc",
                "deals": [{"id": "d1"}, {"id": "d2"}],
            })))
            .await;
        dispatcher
            .dispatch(&packet(json!({
                "type": "prices",
                "accountId": "acc",
                "prices": [{"symbol": "EURUSD"}],
            })))
            .await;

        assert_eq!(
            recorder.events(),
            vec!["deal:\"d1\"", "deal:\"d2\"", "price:EURUSD"]
        );
    }

    #[tokio::test]
    async fn test_orders_replaced_fires_once_even_when_empty() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({"type": "orders", "accountId": "acc"})))
            .await;

        assert_eq!(recorder.events(), vec!["orders_replaced:0"]);
    }

    #[tokio::test]
    async fn test_status_packet_carries_connected_flag() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({
                "type": "status",
                "accountId": "acc",
                "connected": true,
            })))
            .await;

        assert_eq!(recorder.events(), vec!["status:true"]);
    }

    #[tokio::test]
    async fn test_sync_finished_carries_synchronization_id() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({
                "type": "dealSynchronizationFinished",
                "accountId": "acc",
                "synchronizationId": "sync-1",
            })))
            .await;

        assert_eq!(recorder.events(), vec!["deal_sync_finished:sync-1"]);
    }

    // ── Update packets ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_update_packet_preserves_call_order() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({
                "type": "update",
                "accountId": "acc",
                "accountInformation": {"balance": 100},
                "updatedPositions": [{"id": "p1"}],
                "removedPositionIds": ["p2"],
                "updatedOrders": [{"id": "o1"}],
                "completedOrderIds": ["o2"],
                "historyOrders": [{"id": "h1"}],
                "deals": [{"id": "d1"}],
            })))
            .await;

        assert_eq!(
            recorder.events(),
            vec![
                "account_information:100",
                "position_updated:\"p1\"",
                "position_removed:p2",
                "order_updated:\"o1\"",
                "order_completed:o2",
                "history_order:\"h1\"",
                "deal:\"d1\"",
            ]
        );
    }

    // ── Isolation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_listener_failure_does_not_stop_later_listeners() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::new(Exploder) as Arc<dyn SyncListener>);
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({"type": "authenticated", "accountId": "acc"})))
            .await;

        assert_eq!(recorder.events(), vec!["connected"]);
    }

    #[tokio::test]
    async fn test_dispatch_is_scoped_to_the_packet_account() {
        let dispatcher = SyncDispatcher::new();
        let ours = Arc::new(Recorder::default());
        let theirs = Arc::new(Recorder::default());
        dispatcher.add_listener("acc-a", Arc::clone(&ours) as Arc<dyn SyncListener>);
        dispatcher.add_listener("acc-b", Arc::clone(&theirs) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({"type": "authenticated", "accountId": "acc-a"})))
            .await;

        assert_eq!(ours.events(), vec!["connected"]);
        assert!(theirs.events().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_packet_type_is_ignored() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);

        dispatcher
            .dispatch(&packet(json!({"type": "keepalive", "accountId": "acc"})))
            .await;

        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_remove_listener_is_by_identity() {
        let dispatcher = SyncDispatcher::new();
        let keep = Arc::new(Recorder::default());
        let drop_me = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&keep) as Arc<dyn SyncListener>);
        dispatcher.add_listener("acc", Arc::clone(&drop_me) as Arc<dyn SyncListener>);

        let handle: Arc<dyn SyncListener> = Arc::clone(&drop_me) as Arc<dyn SyncListener>;
        dispatcher.remove_listener("acc", &handle);
        assert_eq!(dispatcher.listener_count("acc"), 1);

        dispatcher
            .dispatch(&packet(json!({"type": "authenticated", "accountId": "acc"})))
            .await;

        assert_eq!(keep.events(), vec!["connected"]);
        assert!(drop_me.events().is_empty());
    }

    #[tokio::test]
    async fn test_remove_listeners_stops_delivery() {
        let dispatcher = SyncDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener("acc", Arc::clone(&recorder) as Arc<dyn SyncListener>);
        assert_eq!(dispatcher.listener_count("acc"), 1);

        dispatcher.remove_listeners("acc");
        dispatcher
            .dispatch(&packet(json!({"type": "authenticated", "accountId": "acc"})))
            .await;

        assert_eq!(dispatcher.listener_count("acc"), 0);
        assert!(recorder.events().is_empty());
    }
}
