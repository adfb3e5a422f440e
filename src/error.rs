//! Gateway error taxonomy.
//!
//! The single place where wire error names translate to typed failures.
//! Every RPC surfaces one of these kinds; all of them are local to the
//! calling request except [`GatewayError::Unauthorized`], which closes the
//! transport before the error is reported.

use serde_json::Value;

use crate::protocol::ProcessingError;

/// Typed failure of a gateway operation.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Request rejected by server-side schema validation.
    Validation {
        /// Human-readable description.
        message: String,
        /// Field-level validation details, when the server provides them.
        details: Option<Value>,
    },
    /// Requested entity does not exist.
    NotFound(String),
    /// Terminal state is not yet synchronized to the broker.
    NotSynchronized(String),
    /// Deadline expired before the server replied.
    Timeout(String),
    /// Authentication or broker connection has been lost.
    NotConnected(String),
    /// Trade execution failure reported by the trading server.
    Trade {
        /// Human-readable description.
        message: String,
        /// Numeric trade return code.
        numeric_code: i64,
        /// Symbolic trade return code.
        string_code: String,
    },
    /// Credentials rejected. Fatal: the transport is closed.
    Unauthorized(String),
    /// Any other server-side failure.
    Internal(String),
    /// The connection was closed while the request was in flight.
    Closed(String),
}

impl GatewayError {
    /// Map a wire `processingError` payload to a typed failure.
    #[must_use]
    pub fn from_wire(err: &ProcessingError) -> Self {
        match err.error.as_str() {
            "ValidationError" => Self::Validation {
                message: err.message.clone(),
                details: err.details.clone(),
            },
            "NotFoundError" => Self::NotFound(err.message.clone()),
            "NotSynchronizedError" => Self::NotSynchronized(err.message.clone()),
            "TimeoutError" => Self::Timeout(err.message.clone()),
            "NotAuthenticatedError" => Self::NotConnected(err.message.clone()),
            "TradeError" => Self::Trade {
                message: err.message.clone(),
                numeric_code: err.numeric_code.unwrap_or_default(),
                string_code: err.string_code.clone().unwrap_or_default(),
            },
            "UnauthorizedError" => Self::Unauthorized(err.message.clone()),
            _ => Self::Internal(err.message.clone()),
        }
    }

    /// Whether this failure closes the transport.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { message, .. } => write!(f, "Validation error: {message}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::NotSynchronized(msg) => write!(f, "Not synchronized: {msg}"),
            Self::Timeout(msg) => write!(f, "Timed out: {msg}"),
            Self::NotConnected(msg) => write!(f, "Not connected: {msg}"),
            Self::Trade {
                message,
                numeric_code,
                string_code,
            } => write!(f, "Trade failed ({numeric_code} {string_code}): {message}"),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
            Self::Closed(msg) => write!(f, "Connection closed: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(name: &str) -> ProcessingError {
        ProcessingError {
            request_id: Some("r-1".to_string()),
            error: name.to_string(),
            message: format!("{name} happened"),
            details: None,
            numeric_code: None,
            string_code: None,
        }
    }

    #[test]
    fn test_wire_name_mapping() {
        assert!(matches!(
            GatewayError::from_wire(&wire("ValidationError")),
            GatewayError::Validation { .. }
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("NotFoundError")),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("NotSynchronizedError")),
            GatewayError::NotSynchronized(_)
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("TimeoutError")),
            GatewayError::Timeout(_)
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("NotAuthenticatedError")),
            GatewayError::NotConnected(_)
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("TradeError")),
            GatewayError::Trade { .. }
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("UnauthorizedError")),
            GatewayError::Unauthorized(_)
        ));
        assert!(matches!(
            GatewayError::from_wire(&wire("SomethingNew")),
            GatewayError::Internal(_)
        ));
    }

    #[test]
    fn test_validation_error_carries_details() {
        let mut err = wire("ValidationError");
        err.details = Some(json!([{"parameter": "volume", "message": "required"}]));

        match GatewayError::from_wire(&err) {
            GatewayError::Validation { details, .. } => {
                assert_eq!(details.unwrap()[0]["parameter"], "volume");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_trade_error_carries_codes() {
        let mut err = wire("TradeError");
        err.numeric_code = Some(10006);
        err.string_code = Some("TRADE_RETCODE_REJECT".to_string());

        match GatewayError::from_wire(&err) {
            GatewayError::Trade {
                numeric_code,
                string_code,
                ..
            } => {
                assert_eq!(numeric_code, 10006);
                assert_eq!(string_code, "TRADE_RETCODE_REJECT");
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn test_only_unauthorized_is_fatal() {
        assert!(GatewayError::from_wire(&wire("UnauthorizedError")).is_fatal());
        assert!(!GatewayError::from_wire(&wire("NotAuthenticatedError")).is_fatal());
        assert!(!GatewayError::from_wire(&wire("ValidationError")).is_fatal());
        assert!(!GatewayError::Timeout("t".to_string()).is_fatal());
    }

    #[test]
    fn test_display_names_the_codes() {
        let err = GatewayError::Trade {
            message: "Requote".to_string(),
            numeric_code: 10004,
            string_code: "TRADE_RETCODE_REQUOTE".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("10004"));
        assert!(text.contains("TRADE_RETCODE_REQUOTE"));
        assert!(text.contains("Requote"));
    }
}
