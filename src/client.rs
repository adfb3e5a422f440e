//! Websocket RPC client for the MetaTrader gateway.
//!
//! One websocket multiplexes the RPC traffic of many logical accounts.
//! Outbound requests are correlated to inbound `response` /
//! `processingError` events by `requestId`; inbound `synchronization`
//! events feed the per-account reordering pipeline.
//!
//! # Architecture
//!
//! ```text
//! GatewayClient
//!     ├── connection loop task (tokio-tungstenite, reconnect with backoff)
//!     │       ├── request table: requestId → oneshot resolver
//!     │       └── synchronization → PacketOrderer → dispatcher task
//!     ├── dispatcher task (serializes SyncListener fan-out)
//!     └── gap-report task (re-subscribes broken accounts)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let client = GatewayClient::new(ClientOptions::with_token(token));
//! client.add_sync_listener("accountId", listener);
//! client.connect().await?;
//! client.subscribe("accountId").await?;
//! let info = client.get_account_information("accountId").await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
};

use crate::config::ClientOptions;
use crate::error::GatewayError;
use crate::protocol::{
    Deals, HistoryOrders, ProcessingError, SocketEvent, SyncPacket, TradeResponse,
    EVENT_PROCESSING_ERROR, EVENT_RESPONSE, EVENT_SYNCHRONIZATION,
};
use crate::sync::{
    OutOfOrderReport, PacketOrderer, ReconnectListener, SyncDispatcher, SyncListener,
    DEFAULT_GAP_TIMEOUT,
};
use crate::time::normalize_time_fields;

/// Reconnection backoff configuration.
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CEILING: Duration = Duration::from_secs(5);

/// Length of generated request ids.
const REQUEST_ID_LENGTH: usize = 32;

/// Connection state of the gateway socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Reconnecting after a drop.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
    },
}

/// An in-flight request awaiting its `response` or `processingError`.
#[derive(Debug)]
struct PendingRequest {
    account_id: String,
    request_type: String,
    resolver: oneshot::Sender<Result<Value, GatewayError>>,
}

/// Shared client internals; owned behind an `Arc` so background tasks can
/// reach the request table and pipeline without keeping the client alive.
struct Inner {
    options: ClientOptions,
    /// Handle back to this `Inner` for spawning tasks from `&self`.
    self_weak: Weak<Inner>,
    /// Cooperative-close flag: the reconnect loop runs only while set.
    desired_connected: AtomicBool,
    /// Whether a handshake ever succeeded (reconnect-listener gating).
    ever_connected: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    /// Outcome of the very first connection attempt. `None` until resolved.
    first_result_tx: watch::Sender<Option<Result<(), String>>>,
    requests: StdMutex<HashMap<String, PendingRequest>>,
    send_tx: StdMutex<Option<mpsc::Sender<SocketEvent>>>,
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
    loop_running: tokio::sync::Mutex<bool>,
    dispatcher: Arc<SyncDispatcher>,
    orderer: PacketOrderer,
    dispatch_tx: mpsc::UnboundedSender<SyncPacket>,
    dispatch_rx: StdMutex<Option<mpsc::UnboundedReceiver<SyncPacket>>>,
    report_rx: StdMutex<Option<mpsc::UnboundedReceiver<OutOfOrderReport>>>,
    reconnect_listeners: StdRwLock<Vec<Arc<dyn ReconnectListener>>>,
}

/// Client for the MetaTrader gateway websocket API.
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("application", &self.inner.options.application)
            .field("domain", &self.inner.options.domain)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Create a client. No connection is made until [`GatewayClient::connect`]
    /// (or the first RPC) is called.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (first_result_tx, _) = watch::channel(None);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (orderer, report_rx) = PacketOrderer::new(DEFAULT_GAP_TIMEOUT);

        Self {
            inner: Arc::new_cyclic(|self_weak| Inner {
                options,
                self_weak: Weak::clone(self_weak),
                desired_connected: AtomicBool::new(false),
                ever_connected: AtomicBool::new(false),
                state_tx,
                first_result_tx,
                requests: StdMutex::new(HashMap::new()),
                send_tx: StdMutex::new(None),
                shutdown_tx: StdMutex::new(None),
                loop_running: tokio::sync::Mutex::new(false),
                dispatcher: Arc::new(SyncDispatcher::new()),
                orderer,
                dispatch_tx,
                dispatch_rx: StdMutex::new(Some(dispatch_rx)),
                report_rx: StdMutex::new(Some(report_rx)),
                reconnect_listeners: StdRwLock::new(Vec::new()),
            }),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Whether the socket is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    /// Open the gateway connection.
    ///
    /// Idempotent: concurrent and repeated calls await the same outcome.
    /// Resolves on the first successful handshake; rejects if the very first
    /// attempt fails (the reconnect loop keeps retrying regardless) or if
    /// the connect timeout elapses.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.inner.connect().await
    }

    /// Close the connection cooperatively.
    ///
    /// Every in-flight request is rejected with [`GatewayError::Closed`],
    /// the request table and listener sets are cleared, and the packet
    /// orderer is stopped.
    pub async fn close(&self) {
        self.inner.desired_connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self
            .inner
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
        self.inner
            .send_tx
            .lock()
            .expect("send queue lock poisoned")
            .take();
        self.inner
            .fail_all_requests(&GatewayError::Closed("connection closed".to_string()));
        self.inner.dispatcher.clear();
        self.inner
            .reconnect_listeners
            .write()
            .expect("reconnect listener lock poisoned")
            .clear();
        self.inner.orderer.stop();
        let _ = self.inner.state_tx.send(ConnectionState::Disconnected);
    }

    /// Issue a raw RPC on behalf of an account.
    ///
    /// `request` must be a JSON object carrying at least a `type`; the
    /// client stamps `requestId`, `accountId` and `application`. The reply
    /// payload is returned as-is after timestamp normalization.
    pub async fn rpc(
        &self,
        account_id: &str,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        self.inner.rpc(account_id, request, timeout).await
    }

    /// Register a synchronization listener for an account.
    pub fn add_sync_listener(&self, account_id: &str, listener: Arc<dyn SyncListener>) {
        self.inner.dispatcher.add_listener(account_id, listener);
    }

    /// Remove one synchronization listener by identity.
    pub fn remove_sync_listener(&self, account_id: &str, listener: &Arc<dyn SyncListener>) {
        self.inner.dispatcher.remove_listener(account_id, listener);
    }

    /// Remove every synchronization listener of an account.
    pub fn remove_sync_listeners(&self, account_id: &str) {
        self.inner.dispatcher.remove_listeners(account_id);
    }

    /// Register a listener notified after every reconnect.
    pub fn add_reconnect_listener(&self, listener: Arc<dyn ReconnectListener>) {
        self.inner
            .reconnect_listeners
            .write()
            .expect("reconnect listener lock poisoned")
            .push(listener);
    }

    // ── Account state RPCs ───────────────────────────────────────────────

    /// Fetch the current account information.
    pub async fn get_account_information(&self, account_id: &str) -> Result<Value, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "getAccountInformation"}), None)
            .await?;
        Ok(payload(&response, "accountInformation"))
    }

    /// Fetch all open positions.
    pub async fn get_positions(&self, account_id: &str) -> Result<Vec<Value>, GatewayError> {
        let response = self.rpc(account_id, json!({"type": "getPositions"}), None).await?;
        Ok(payload_array(&response, "positions"))
    }

    /// Fetch one open position by id.
    pub async fn get_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getPosition", "positionId": position_id}),
                None,
            )
            .await?;
        Ok(payload(&response, "position"))
    }

    /// Fetch all pending orders.
    pub async fn get_orders(&self, account_id: &str) -> Result<Vec<Value>, GatewayError> {
        let response = self.rpc(account_id, json!({"type": "getOrders"}), None).await?;
        Ok(payload_array(&response, "orders"))
    }

    /// Fetch one pending order by id.
    pub async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Value, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "getOrder", "orderId": order_id}), None)
            .await?;
        Ok(payload(&response, "order"))
    }

    // ── History RPCs ─────────────────────────────────────────────────────

    /// Fetch history orders by ticket.
    pub async fn get_history_orders_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<HistoryOrders, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getHistoryOrdersByTicket", "ticket": ticket}),
                None,
            )
            .await?;
        Ok(history_orders(response))
    }

    /// Fetch history orders by position id.
    pub async fn get_history_orders_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<HistoryOrders, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getHistoryOrdersByPosition", "positionId": position_id}),
                None,
            )
            .await?;
        Ok(history_orders(response))
    }

    /// Fetch history orders within a time range.
    pub async fn get_history_orders_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<HistoryOrders, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({
                    "type": "getHistoryOrdersByTimeRange",
                    "startTime": start_time.to_rfc3339(),
                    "endTime": end_time.to_rfc3339(),
                    "offset": offset,
                    "limit": limit,
                }),
                None,
            )
            .await?;
        Ok(history_orders(response))
    }

    /// Fetch deals by ticket.
    pub async fn get_deals_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<Deals, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "getDealsByTicket", "ticket": ticket}), None)
            .await?;
        Ok(deals(response))
    }

    /// Fetch deals by position id.
    pub async fn get_deals_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<Deals, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getDealsByPosition", "positionId": position_id}),
                None,
            )
            .await?;
        Ok(deals(response))
    }

    /// Fetch deals within a time range.
    pub async fn get_deals_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Deals, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({
                    "type": "getDealsByTimeRange",
                    "startTime": start_time.to_rfc3339(),
                    "endTime": end_time.to_rfc3339(),
                    "offset": offset,
                    "limit": limit,
                }),
                None,
            )
            .await?;
        Ok(deals(response))
    }

    /// Clear the account's order and deal history server-side.
    pub async fn remove_history(&self, account_id: &str) -> Result<(), GatewayError> {
        self.rpc(account_id, json!({"type": "removeHistory"}), None)
            .await
            .map(|_| ())
    }

    /// Remove the application's server-side state for the account.
    pub async fn remove_application(&self, account_id: &str) -> Result<(), GatewayError> {
        self.rpc(account_id, json!({"type": "removeApplication"}), None)
            .await
            .map(|_| ())
    }

    // ── Trading ──────────────────────────────────────────────────────────

    /// Execute a trade.
    ///
    /// A response whose return code is outside the accepted set raises
    /// [`GatewayError::Trade`] carrying the numeric and string codes.
    pub async fn trade(&self, account_id: &str, trade: Value) -> Result<TradeResponse, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "trade", "trade": trade}), None)
            .await?;
        let result: TradeResponse = serde_json::from_value(payload(&response, "response"))
            .map_err(|e| GatewayError::Internal(format!("malformed trade response: {e}")))?;
        if result.is_success() {
            Ok(result)
        } else {
            Err(GatewayError::Trade {
                message: result.message,
                numeric_code: result.numeric_code,
                string_code: result.string_code,
            })
        }
    }

    // ── Subscriptions & synchronization ──────────────────────────────────

    /// Subscribe the account to the synchronization stream.
    ///
    /// Fire-and-forget: a server that accepts the subscription may never
    /// answer the request itself and push packets instead, so `Timeout` is
    /// suppressed. Any other failure is logged and returned.
    pub async fn subscribe(&self, account_id: &str) -> Result<(), GatewayError> {
        self.inner.subscribe(account_id).await
    }

    /// Ask the gateway to reconnect the account's terminal to the broker.
    pub async fn reconnect_terminal(&self, account_id: &str) -> Result<(), GatewayError> {
        self.rpc(account_id, json!({"type": "reconnect"}), None)
            .await
            .map(|_| ())
    }

    /// Request a state synchronization round.
    ///
    /// `synchronization_id` doubles as the request id so server-side
    /// correlation survives client restarts.
    pub async fn synchronize(
        &self,
        account_id: &str,
        synchronization_id: &str,
        starting_history_order_time: Option<DateTime<Utc>>,
        starting_deal_time: Option<DateTime<Utc>>,
    ) -> Result<(), GatewayError> {
        let mut request = json!({
            "requestId": synchronization_id,
            "type": "synchronize",
        });
        if let Some(time) = starting_history_order_time {
            request["startingHistoryOrderTime"] = json!(time.to_rfc3339());
        }
        if let Some(time) = starting_deal_time {
            request["startingDealTime"] = json!(time.to_rfc3339());
        }
        self.rpc(account_id, request, None).await.map(|_| ())
    }

    /// Wait server-side until the account is synchronized.
    ///
    /// The client-side deadline is one second longer than the server-side
    /// wait so the server reply always wins the race.
    pub async fn wait_synchronized(
        &self,
        account_id: &str,
        application_pattern: Option<&str>,
        timeout_in_seconds: u64,
    ) -> Result<(), GatewayError> {
        let mut request = json!({
            "type": "waitSynchronized",
            "timeoutInSeconds": timeout_in_seconds,
        });
        if let Some(pattern) = application_pattern {
            request["applicationPattern"] = json!(pattern);
        }
        self.rpc(
            account_id,
            request,
            Some(Duration::from_secs(timeout_in_seconds + 1)),
        )
        .await
        .map(|_| ())
    }

    /// Subscribe to streaming market data for a symbol.
    pub async fn subscribe_to_market_data(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<(), GatewayError> {
        self.rpc(
            account_id,
            json!({"type": "subscribeToMarketData", "symbol": symbol}),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Fetch a symbol specification.
    pub async fn get_symbol_specification(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getSymbolSpecification", "symbol": symbol}),
                None,
            )
            .await?;
        Ok(payload(&response, "specification"))
    }

    /// Fetch the current price of a symbol.
    pub async fn get_symbol_price(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getSymbolPrice", "symbol": symbol}),
                None,
            )
            .await?;
        Ok(payload(&response, "price"))
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.inner.desired_connected.store(false, Ordering::SeqCst);
        if let Ok(mut tx) = self.inner.shutdown_tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl Inner {
    fn desired(&self) -> bool {
        self.desired_connected.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Reject and drop every in-flight request.
    fn fail_all_requests(&self, error: &GatewayError) {
        let pending: Vec<PendingRequest> = {
            let mut requests = self.requests.lock().expect("request table lock poisoned");
            requests.drain().map(|(_, pending)| pending).collect()
        };
        for request in pending {
            log::debug!(
                "rejecting in-flight request {} for account {}: {error}",
                request.request_type,
                request.account_id
            );
            let _ = request.resolver.send(Err(error.clone()));
        }
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        self.desired_connected.store(true, Ordering::SeqCst);

        {
            let mut running = self.loop_running.lock().await;
            if !*running {
                let Some(inner) = self.self_weak.upgrade() else {
                    return Err(GatewayError::Closed("client dropped".to_string()));
                };
                *running = true;
                self.spawn_pipeline_tasks();
                self.orderer.start();

                let (send_tx, send_rx) = mpsc::channel(100);
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                *self.send_tx.lock().expect("send queue lock poisoned") = Some(send_tx);
                *self.shutdown_tx.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);

                tokio::spawn(async move {
                    run_connection_loop(inner, send_rx, shutdown_rx).await;
                });
            }
        }

        let connect_timeout = self.options.connect_timeout;
        let initial = self.first_result_tx.borrow().is_none();
        if initial {
            // First-ever connect: resolve with the first attempt's outcome.
            let mut first_rx = self.first_result_tx.subscribe();
            let outcome =
                tokio::time::timeout(connect_timeout, first_rx.wait_for(|v| v.is_some())).await;
            match outcome {
                Err(_) => Err(GatewayError::Timeout(
                    "timed out waiting for gateway connection".to_string(),
                )),
                Ok(Err(_)) => Err(GatewayError::Closed(
                    "connection task ended".to_string(),
                )),
                Ok(Ok(result)) => match result.clone() {
                    Some(Ok(())) => Ok(()),
                    Some(Err(message)) => Err(GatewayError::NotConnected(message)),
                    None => Err(GatewayError::Internal(
                        "connect outcome missing".to_string(),
                    )),
                },
            }
        } else {
            // Loop already ran at least once: await a live connection.
            let mut state_rx = self.state_tx.subscribe();
            tokio::time::timeout(
                connect_timeout,
                state_rx.wait_for(|s| *s == ConnectionState::Connected),
            )
            .await
            .map_err(|_| {
                GatewayError::Timeout("timed out waiting for gateway connection".to_string())
            })?
            .map_err(|_| GatewayError::Closed("connection task ended".to_string()))?;
            Ok(())
        }
    }

    async fn rpc(
        &self,
        account_id: &str,
        mut request: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        self.connect().await?;

        let Some(map) = request.as_object_mut() else {
            return Err(GatewayError::Internal(
                "request must be a JSON object".to_string(),
            ));
        };

        // Reuse a caller-supplied id (synchronization requests) or mint one.
        let request_id = map
            .get("requestId")
            .and_then(Value::as_str)
            .map_or_else(random_request_id, ToString::to_string);
        map.insert("requestId".to_string(), json!(request_id));
        map.insert("accountId".to_string(), json!(account_id));
        map.insert("application".to_string(), json!(self.options.application));
        let request_type = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let (resolver, response_rx) = oneshot::channel();
        {
            let mut requests = self.requests.lock().expect("request table lock poisoned");
            if requests.contains_key(&request_id) {
                return Err(GatewayError::Internal(format!(
                    "request id {request_id} is already in flight"
                )));
            }
            requests.insert(
                request_id.clone(),
                PendingRequest {
                    account_id: account_id.to_string(),
                    request_type: request_type.clone(),
                    resolver,
                },
            );
        }

        let sender = self
            .send_tx
            .lock()
            .expect("send queue lock poisoned")
            .clone();
        let Some(sender) = sender else {
            self.remove_request(&request_id);
            return Err(GatewayError::NotConnected(
                "socket is not connected".to_string(),
            ));
        };
        if sender.send(SocketEvent::request(request)).await.is_err() {
            self.remove_request(&request_id);
            return Err(GatewayError::Closed("connection closed".to_string()));
        }

        let deadline = timeout.unwrap_or(self.options.request_timeout);
        match tokio::time::timeout(deadline, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Closed("connection closed".to_string())),
            Err(_) => {
                self.remove_request(&request_id);
                Err(GatewayError::Timeout(format!(
                    "request {request_id} of type {request_type} timed out"
                )))
            }
        }
    }

    async fn subscribe(&self, account_id: &str) -> Result<(), GatewayError> {
        match self.rpc(account_id, json!({"type": "subscribe"}), None).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Timeout(_)) => {
                // The server acknowledges subscriptions by pushing packets,
                // not necessarily by answering the request.
                log::debug!("subscribe request for {account_id} timed out, awaiting packets");
                Ok(())
            }
            Err(e) => {
                log::error!("failed to subscribe account {account_id}: {e}");
                Err(e)
            }
        }
    }

    fn remove_request(&self, request_id: &str) {
        self.requests
            .lock()
            .expect("request table lock poisoned")
            .remove(request_id);
    }

    /// Spawn the dispatcher and gap-report tasks. Runs once per client.
    fn spawn_pipeline_tasks(&self) {
        if let Some(mut dispatch_rx) = self
            .dispatch_rx
            .lock()
            .expect("dispatch queue lock poisoned")
            .take()
        {
            // One consumer per client serializes listener fan-out, which is
            // what keeps per-account sequence order observable.
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                while let Some(packet) = dispatch_rx.recv().await {
                    dispatcher.dispatch(&packet).await;
                }
            });
        }

        if let Some(mut report_rx) = self
            .report_rx
            .lock()
            .expect("report queue lock poisoned")
            .take()
        {
            let weak = Weak::clone(&self.self_weak);
            tokio::spawn(async move {
                while let Some(report) = report_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    log::warn!(
                        "synchronization stream for {} is out of order (expected {}, observed {}), re-subscribing",
                        report.account_id,
                        report.expected_sequence,
                        report.observed_sequence
                    );
                    if let Err(e) = inner.subscribe(&report.account_id).await {
                        log::error!(
                            "failed to re-subscribe account {} after gap: {e}",
                            report.account_id
                        );
                    }
                }
            });
        }
    }

    /// Publish the outcome of the very first connection attempt.
    fn publish_first_result(&self, result: Result<(), String>) {
        self.first_result_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Notify reconnect listeners sequentially off the socket task.
    fn notify_reconnect_listeners(&self) {
        let listeners: Vec<Arc<dyn ReconnectListener>> = self
            .reconnect_listeners
            .read()
            .expect("reconnect listener lock poisoned")
            .clone();
        if listeners.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for listener in listeners {
                if let Err(e) = listener.on_reconnected().await {
                    log::error!("reconnect listener failed: {e:#}");
                }
            }
        });
    }
}

/// Generate a 32-character random alphanumeric request id.
fn random_request_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(REQUEST_ID_LENGTH)
        .map(char::from)
        .collect()
}

fn payload(response: &Value, key: &str) -> Value {
    response.get(key).cloned().unwrap_or(Value::Null)
}

fn payload_array(response: &Value, key: &str) -> Vec<Value> {
    response
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn history_orders(response: Value) -> HistoryOrders {
    serde_json::from_value(response).unwrap_or_default()
}

fn deals(response: Value) -> Deals {
    serde_json::from_value(response).unwrap_or_default()
}

// ─── Connection loop ────────────────────────────────────────────────────────

/// Whether the message loop ended because the transport must close.
#[derive(Debug, PartialEq, Eq)]
enum LoopControl {
    Continue,
    CloseTransport,
}

/// Run the connection with automatic reconnection until shutdown.
async fn run_connection_loop(
    inner: Arc<Inner>,
    mut send_rx: mpsc::Receiver<SocketEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut backoff = RECONNECT_BACKOFF_FLOOR;
    let mut attempt = 0u32;

    loop {
        if !inner.desired() || shutdown_rx.try_recv().is_ok() {
            break;
        }

        inner.set_state(ConnectionState::Connecting);

        match tokio::time::timeout(inner.options.connect_timeout, connect_websocket(&inner.options))
            .await
        {
            Ok(Ok(stream)) => {
                log::info!("connected to gateway at {}", inner.options.domain);
                inner.publish_first_result(Ok(()));
                inner.set_state(ConnectionState::Connected);
                backoff = RECONNECT_BACKOFF_FLOOR;
                attempt = 0;

                if inner.ever_connected.swap(true, Ordering::SeqCst) {
                    inner.notify_reconnect_listeners();
                }

                let shutdown =
                    run_message_loop(&inner, stream, &mut send_rx, &mut shutdown_rx).await;
                if shutdown {
                    break;
                }
                log::warn!("disconnected from gateway");
            }
            Ok(Err(e)) => {
                log::warn!("failed to connect to gateway: {e}");
                inner.publish_first_result(Err(e));
            }
            Err(_) => {
                log::warn!("gateway connection attempt timed out");
                inner.publish_first_result(Err("connect timed out".to_string()));
            }
        }

        if !inner.desired() {
            break;
        }

        // Jittered backoff between attempts, floor 1 s, ceiling 5 s.
        attempt += 1;
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        let wait = backoff + jitter;
        inner.set_state(ConnectionState::Reconnecting { attempt });
        log::info!("reconnecting to gateway in {:.1}s", wait.as_secs_f32());

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = &mut shutdown_rx => break,
        }

        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEILING);
    }

    inner.set_state(ConnectionState::Disconnected);
    inner.fail_all_requests(&GatewayError::Closed("connection closed".to_string()));
    *inner.loop_running.lock().await = false;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial the gateway websocket.
async fn connect_websocket(options: &ClientOptions) -> Result<WsStream, String> {
    let url = options.websocket_url();
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid gateway URL: {e}"))?;

    // Random client id so the gateway can tell client instances apart.
    let client_id = uuid::Uuid::new_v4().to_string();
    request.headers_mut().insert(
        "Client-id",
        client_id.parse().map_err(|e| format!("invalid client id: {e}"))?,
    );

    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| format!("websocket connect failed: {e}"))?;
    Ok(stream)
}

/// Run the message loop until disconnect.
///
/// Returns `true` when the exit is permanent (shutdown signal or a fatal
/// error closed the transport); `false` asks the caller to reconnect.
async fn run_message_loop(
    inner: &Arc<Inner>,
    stream: WsStream,
    send_rx: &mut mpsc::Receiver<SocketEvent>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            Some(event) = send_rx.recv() => {
                let text = serde_json::to_string(&event).expect("socket event serializable");
                if let Err(e) = write.send(Message::Text(text)).await {
                    log::error!("failed to send request: {e}");
                    return false;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_event(inner, &text) == LoopControl::CloseTransport {
                            return true;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            log::warn!("failed to send pong");
                            return false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("websocket closed by gateway");
                        return false;
                    }
                    Some(Err(e)) => {
                        log::error!("websocket error: {e}");
                        return false;
                    }
                    _ => {}
                }
            }

            _ = &mut *shutdown_rx => {
                log::info!("shutdown signal received");
                return true;
            }
        }
    }
}

/// Route one inbound event.
fn handle_event(inner: &Arc<Inner>, text: &str) -> LoopControl {
    let Ok(mut event) = serde_json::from_str::<SocketEvent>(text) else {
        log::debug!("ignoring malformed gateway frame");
        return LoopControl::Continue;
    };
    normalize_time_fields(&mut event.data);

    match event.event.as_str() {
        EVENT_RESPONSE => {
            let Some(request_id) = event.data.get("requestId").and_then(Value::as_str) else {
                log::warn!("response without requestId");
                return LoopControl::Continue;
            };
            let pending = inner
                .requests
                .lock()
                .expect("request table lock poisoned")
                .remove(request_id);
            match pending {
                Some(request) => {
                    let _ = request.resolver.send(Ok(event.data));
                }
                // Late reply after timeout or close: drop silently.
                None => log::debug!("discarding response for unknown request {request_id}"),
            }
            LoopControl::Continue
        }

        EVENT_PROCESSING_ERROR => match serde_json::from_value::<ProcessingError>(event.data) {
            Ok(wire) => {
                let error = GatewayError::from_wire(&wire);
                let fatal = error.is_fatal();

                if let Some(request_id) = wire.request_id.as_deref() {
                    let pending = inner
                        .requests
                        .lock()
                        .expect("request table lock poisoned")
                        .remove(request_id);
                    match pending {
                        Some(request) => {
                            let _ = request.resolver.send(Err(error));
                        }
                        None => {
                            log::debug!("discarding error for unknown request {request_id}")
                        }
                    }
                }

                if fatal {
                    log::error!("gateway rejected credentials, closing connection");
                    inner.desired_connected.store(false, Ordering::SeqCst);
                    inner.fail_all_requests(&GatewayError::Closed(
                        "connection closed".to_string(),
                    ));
                    inner.dispatcher.clear();
                    inner.orderer.stop();
                    return LoopControl::CloseTransport;
                }
                LoopControl::Continue
            }
            Err(e) => {
                log::warn!("malformed processingError event: {e}");
                LoopControl::Continue
            }
        },

        EVENT_SYNCHRONIZATION => {
            match serde_json::from_value::<SyncPacket>(event.data) {
                Ok(packet) => {
                    for ordered in inner.orderer.restore_order(packet) {
                        // Receiver lives as long as the client.
                        let _ = inner.dispatch_tx.send(ordered);
                    }
                }
                Err(e) => log::warn!("malformed synchronization packet: {e}"),
            }
            LoopControl::Continue
        }

        other => {
            log::debug!("ignoring unknown gateway event {other}");
            LoopControl::Continue
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
