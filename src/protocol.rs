//! Gateway wire protocol types.
//!
//! Every websocket text frame exchanged with the gateway is one JSON-encoded
//! [`SocketEvent`]:
//!
//! ```text
//! {"event": "<name>", "data": {...}}
//! ```
//!
//! Event names:
//! - `request`          — client → gateway RPC envelope
//! - `response`         — gateway → client RPC result, correlated by `requestId`
//! - `processingError`  — gateway → client RPC failure, correlated by `requestId`
//! - `synchronization`  — gateway → client state-sync packet (see [`SyncPacket`])
//!
//! Request envelopes are `{requestId, accountId, application, type, ...}`;
//! response payloads are keyed by request type and stay opaque
//! [`serde_json::Value`]s — the trading data model evolves server-side and is
//! not mirrored here.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Socket events ──────────────────────────────────────────────────────────

/// Outbound event name for RPC requests.
pub const EVENT_REQUEST: &str = "request";
/// Inbound event name for RPC responses.
pub const EVENT_RESPONSE: &str = "response";
/// Inbound event name for RPC failures.
pub const EVENT_PROCESSING_ERROR: &str = "processingError";
/// Inbound event name for state-synchronization packets.
pub const EVENT_SYNCHRONIZATION: &str = "synchronization";

/// A single named event on the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketEvent {
    /// Event name (`request`, `response`, `processingError`, `synchronization`).
    pub event: String,
    /// JSON payload of the event.
    pub data: Value,
}

impl SocketEvent {
    /// Build an outbound `request` event.
    #[must_use]
    pub fn request(data: Value) -> Self {
        Self {
            event: EVENT_REQUEST.to_string(),
            data,
        }
    }
}

// ─── Synchronization packets ────────────────────────────────────────────────

/// A state-synchronization packet pushed by the gateway.
///
/// Sync packets carry a per-account `sequenceNumber` used by the packet
/// orderer; control packets (no sequence number) bypass reordering. The
/// per-type payload stays in `body` as opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPacket {
    /// Packet type (`authenticated`, `prices`, `update`, ...).
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Account this packet belongs to.
    pub account_id: String,
    /// Per-account monotonically increasing ordinal. Absent on control packets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Remaining per-type payload fields.
    #[serde(flatten)]
    pub body: serde_json::Map<String, Value>,
}

impl SyncPacket {
    /// Look up a payload field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// A payload field as an array slice, or an empty slice when the field
    /// is absent or not an array.
    #[must_use]
    pub fn array_field(&self, name: &str) -> &[Value] {
        self.body
            .get(name)
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }
}

// ─── Processing errors ──────────────────────────────────────────────────────

/// Wire form of a `processingError` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingError {
    /// Request id the failure correlates to. Absent for transport-level errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Wire error name (`ValidationError`, `UnauthorizedError`, ...).
    pub error: String,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
    /// Validation details payload, when the server provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Trade failure numeric code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_code: Option<i64>,
    /// Trade failure string code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_code: Option<String>,
}

// ─── Trade responses ────────────────────────────────────────────────────────

/// Return codes the trading server reports for an accepted trade.
///
/// Any other code is a trade failure and surfaces as
/// [`GatewayError::Trade`](crate::error::GatewayError::Trade).
pub const TRADE_SUCCESS_CODES: [&str; 5] = [
    "ERR_NO_ERROR",
    "TRADE_RETCODE_PLACED",
    "TRADE_RETCODE_DONE",
    "TRADE_RETCODE_DONE_PARTIAL",
    "TRADE_RETCODE_NO_CHANGES",
];

/// Result payload of a `trade` request.
///
/// Older gateway versions report `error`/`description` instead of
/// `numericCode`/`stringCode`; both spellings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    /// Numeric trade return code.
    #[serde(alias = "error", default)]
    pub numeric_code: i64,
    /// Symbolic trade return code.
    #[serde(alias = "description", default)]
    pub string_code: String,
    /// Human-readable result description.
    #[serde(default)]
    pub message: String,
    /// Id of the order created by the trade, when one was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Id of the position affected by the trade, when one was affected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

impl TradeResponse {
    /// Whether the return code indicates an accepted trade.
    #[must_use]
    pub fn is_success(&self) -> bool {
        TRADE_SUCCESS_CODES.contains(&self.string_code.as_str())
    }
}

// ─── History payloads ───────────────────────────────────────────────────────

/// Result payload of the `getHistoryOrdersBy*` requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOrders {
    /// Matching history orders, oldest first.
    #[serde(default)]
    pub history_orders: Vec<Value>,
    /// True while the account history is still being synchronized server-side.
    #[serde(default)]
    pub synchronizing: bool,
}

/// Result payload of the `getDealsBy*` requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deals {
    /// Matching deals, oldest first.
    #[serde(default)]
    pub deals: Vec<Value>,
    /// True while the account history is still being synchronized server-side.
    #[serde(default)]
    pub synchronizing: bool,
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── SocketEvent ───────────────────────────────────────────────────────

    #[test]
    fn test_socket_event_round_trip() {
        let event = SocketEvent::request(json!({"requestId": "abc", "type": "subscribe"}));
        let text = serde_json::to_string(&event).unwrap();
        let parsed: SocketEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.event, "request");
        assert_eq!(parsed.data["type"], "subscribe");
    }

    // ── SyncPacket ────────────────────────────────────────────────────────

    #[test]
    fn test_sync_packet_parses_envelope_and_body() {
        let packet: SyncPacket = serde_json::from_value(json!({
            "type": "prices",
            "accountId": "acc-1",
            "sequenceNumber": 17,
            "prices": [{"symbol": "EURUSD"}],
        }))
        .unwrap();

        assert_eq!(packet.packet_type, "prices");
        assert_eq!(packet.account_id, "acc-1");
        assert_eq!(packet.sequence_number, Some(17));
        assert_eq!(packet.array_field("prices").len(), 1);
    }

    #[test]
    fn test_sync_packet_without_sequence_number() {
        let packet: SyncPacket = serde_json::from_value(json!({
            "type": "status",
            "accountId": "acc-1",
            "connected": true,
        }))
        .unwrap();

        assert!(packet.sequence_number.is_none());
        assert_eq!(packet.field("connected"), Some(&json!(true)));
    }

    #[test]
    fn test_array_field_tolerates_missing_and_non_array() {
        let packet: SyncPacket = serde_json::from_value(json!({
            "type": "deals",
            "accountId": "acc-1",
            "deals": "not-an-array",
        }))
        .unwrap();

        assert!(packet.array_field("deals").is_empty());
        assert!(packet.array_field("absent").is_empty());
    }

    // ── TradeResponse ─────────────────────────────────────────────────────

    #[test]
    fn test_trade_response_success_codes() {
        for code in TRADE_SUCCESS_CODES {
            let response: TradeResponse = serde_json::from_value(json!({
                "numericCode": 0,
                "stringCode": code,
                "message": "ok",
            }))
            .unwrap();
            assert!(response.is_success(), "{code} should be a success code");
        }
    }

    #[test]
    fn test_trade_response_failure_code() {
        let response: TradeResponse = serde_json::from_value(json!({
            "numericCode": 10004,
            "stringCode": "TRADE_RETCODE_REQUOTE",
            "message": "Requote",
        }))
        .unwrap();
        assert!(!response.is_success());
        assert_eq!(response.numeric_code, 10004);
    }

    #[test]
    fn test_trade_response_legacy_aliases() {
        let response: TradeResponse = serde_json::from_value(json!({
            "error": 10009,
            "description": "TRADE_RETCODE_DONE",
            "message": "done",
            "orderId": "46870472",
        }))
        .unwrap();
        assert_eq!(response.numeric_code, 10009);
        assert_eq!(response.string_code, "TRADE_RETCODE_DONE");
        assert!(response.is_success());
        assert_eq!(response.order_id.as_deref(), Some("46870472"));
    }

    // ── ProcessingError ───────────────────────────────────────────────────

    #[test]
    fn test_processing_error_minimal() {
        let err: ProcessingError = serde_json::from_value(json!({
            "requestId": "r-1",
            "error": "NotFoundError",
            "message": "Position not found",
        }))
        .unwrap();
        assert_eq!(err.request_id.as_deref(), Some("r-1"));
        assert_eq!(err.error, "NotFoundError");
        assert!(err.details.is_none());
    }

    // ── History payloads ──────────────────────────────────────────────────

    #[test]
    fn test_history_orders_defaults() {
        let payload: HistoryOrders = serde_json::from_value(json!({
            "historyOrders": [{"id": "1"}],
        }))
        .unwrap();
        assert_eq!(payload.history_orders.len(), 1);
        assert!(!payload.synchronizing);
    }
}
