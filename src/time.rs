//! Timestamp normalization for inbound payloads.
//!
//! The gateway stamps every instant-valued field as an ISO-8601 string. The
//! trading data model is large and evolves server-side, so payloads stay
//! [`serde_json::Value`] and normalization is a generic walk rather than
//! schema-driven parsing: every object field whose name ends in `time` or
//! `Time` is parsed with chrono and rewritten as the canonical RFC3339 UTC
//! millisecond form (the serde serialization of `DateTime<Utc>`, this crate's
//! instant type). [`instant`] lifts a normalized field back to a
//! `DateTime<Utc>`.
//!
//! `brokerTime` / `BrokerTime` fields are broker-local wall-clock duplicates
//! (`YYYY-MM-DD HH:mm:ss.SSS` in the broker time zone) and stay untouched for
//! display.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Containers nested deeper than this are left as-is. Payloads are trees in
/// practice; the cap bounds the walk on adversarial input.
const MAX_WALK_DEPTH: usize = 128;

/// Normalize every instant-valued field of `value` in place.
///
/// Idempotent: normalizing an already-normalized payload is a no-op. Strings
/// chrono cannot parse and non-string values under time-named keys are left
/// untouched.
pub fn normalize_time_fields(value: &mut Value) {
    walk(value, 0);
}

/// Parse a normalized (or any ISO-8601) field back to an instant.
#[must_use]
pub fn instant(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn walk(value: &mut Value, depth: usize) {
    if depth > MAX_WALK_DEPTH {
        log::warn!("payload nesting exceeds {MAX_WALK_DEPTH} levels, leaving subtree untouched");
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if is_time_key(key) {
                    if let Value::String(text) = field {
                        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                            *field = Value::String(
                                parsed
                                    .with_timezone(&Utc)
                                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                            );
                        }
                        continue;
                    }
                }
                // Each container is visited exactly once.
                walk(field, depth + 1);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk(item, depth + 1);
            }
        }
        _ => {}
    }
}

fn is_time_key(key: &str) -> bool {
    (key.ends_with("time") || key.ends_with("Time"))
        && key != "brokerTime"
        && key != "BrokerTime"
}
