//! Connection health and uptime derivation.
//!
//! The monitor is a [`SyncListener`]: register it on the account so price
//! updates reach [`HealthMonitor::on_symbol_price_updated`]. Two 1 s ticks
//! (armed by [`HealthMonitor::start`]) derive the rest:
//!
//! - **Quote health.** The broker clock is reconstructed from the offset
//!   between the client clock and the last price timestamp. Quotes are
//!   healthy when no symbols are subscribed, when the broker clock is
//!   outside every quote session of every subscribed symbol, or when the
//!   last price update is recent enough.
//! - **Uptime.** Pushes `100`/`0` into a rolling 7-day reservoir of 168
//!   one-hour sub-windows; [`HealthMonitor::uptime`] is the average.
//!
//! Tick failures are logged with a wall-clock timestamp and the account id;
//! the monitor stays live regardless.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, TimeDelta, Utc, Weekday};
use serde_json::Value;

use super::reservoir::StatisticalReservoir;
use super::{SyncListener, TerminalState};

/// Default maximum age of the last price update for quotes to count as
/// streaming.
pub const DEFAULT_MIN_QUOTE_INTERVAL: Duration = Duration::from_secs(60);

/// Tick cadence for both the quote-health and uptime measurements.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Uptime reservoir: 168 one-hour sub-windows over 7 days.
const UPTIME_WINDOW_COUNT: usize = 168;
const UPTIME_WINDOW_SPAN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Composite health snapshot of one account connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealthStatus {
    /// API connection established.
    pub connected: bool,
    /// Terminal connected to the broker.
    pub connected_to_broker: bool,
    /// Quotes are streaming while they should be.
    pub quote_streaming_healthy: bool,
    /// Local terminal state synchronized to the broker.
    pub synchronized: bool,
    /// Conjunction of the four booleans above.
    pub healthy: bool,
    /// Human-readable status description.
    pub message: String,
}

/// Quote-stream observations shared between the listener and the ticks.
#[derive(Debug)]
struct QuoteState {
    /// When the last price update arrived, client clock.
    last_quote_at: Option<Instant>,
    /// Client clock minus broker quote timestamp.
    broker_offset: TimeDelta,
    /// Result of the last quote-health tick.
    quotes_healthy: bool,
}

impl Default for QuoteState {
    fn default() -> Self {
        Self {
            last_quote_at: None,
            broker_offset: TimeDelta::zero(),
            quotes_healthy: true,
        }
    }
}

/// Derives connection health and uptime for one account.
pub struct HealthMonitor {
    account_id: String,
    terminal_state: Arc<dyn TerminalState>,
    min_quote_interval: Duration,
    quotes: Arc<Mutex<QuoteState>>,
    uptime: Arc<Mutex<StatisticalReservoir>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("account_id", &self.account_id)
            .field("min_quote_interval", &self.min_quote_interval)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor over the given terminal-state view.
    #[must_use]
    pub fn new(account_id: impl Into<String>, terminal_state: Arc<dyn TerminalState>) -> Self {
        Self::with_min_quote_interval(account_id, terminal_state, DEFAULT_MIN_QUOTE_INTERVAL)
    }

    /// Create a monitor with a custom quote staleness threshold.
    #[must_use]
    pub fn with_min_quote_interval(
        account_id: impl Into<String>,
        terminal_state: Arc<dyn TerminalState>,
        min_quote_interval: Duration,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            terminal_state,
            min_quote_interval,
            quotes: Arc::new(Mutex::new(QuoteState::default())),
            uptime: Arc::new(Mutex::new(StatisticalReservoir::new(
                UPTIME_WINDOW_COUNT,
                UPTIME_WINDOW_SPAN,
            ))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Arm the quote-health and uptime ticks. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("health task lock poisoned");
        if !tasks.is_empty() {
            return;
        }

        {
            let account_id = self.account_id.clone();
            let terminal_state = Arc::clone(&self.terminal_state);
            let quotes = Arc::clone(&self.quotes);
            let min_quote_interval = self.min_quote_interval;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(TICK_INTERVAL);
                loop {
                    interval.tick().await;
                    if let Err(e) =
                        check_quote_health(terminal_state.as_ref(), &quotes, min_quote_interval)
                    {
                        log::error!(
                            "[{}] quote health tick failed for account {account_id}: {e:#}",
                            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f")
                        );
                    }
                }
            }));
        }

        {
            let account_id = self.account_id.clone();
            let terminal_state = Arc::clone(&self.terminal_state);
            let quotes = Arc::clone(&self.quotes);
            let uptime = Arc::clone(&self.uptime);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(TICK_INTERVAL);
                loop {
                    interval.tick().await;
                    if let Err(e) = record_uptime(terminal_state.as_ref(), &quotes, &uptime) {
                        log::error!(
                            "[{}] uptime tick failed for account {account_id}: {e:#}",
                            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f")
                        );
                    }
                }
            }));
        }
    }

    /// Disarm the ticks.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("health task lock poisoned").drain(..) {
            task.abort();
        }
    }

    /// Current composite health snapshot.
    #[must_use]
    pub fn health_status(&self) -> ConnectionHealthStatus {
        let connected = self.terminal_state.connected();
        let connected_to_broker = self.terminal_state.connected_to_broker();
        let synchronized = self.terminal_state.synchronized();
        let quote_streaming_healthy = self
            .quotes
            .lock()
            .expect("quote state lock poisoned")
            .quotes_healthy;

        let healthy = connected && connected_to_broker && quote_streaming_healthy && synchronized;
        let message = if healthy {
            "Connection is healthy".to_string()
        } else {
            let mut reasons = Vec::new();
            if !connected {
                reasons.push("connection to API server is not established or lost");
            }
            if !connected_to_broker {
                reasons.push("connection to broker is not established or lost");
            }
            if !synchronized {
                reasons.push("local terminal state is not synchronized to broker");
            }
            if !quote_streaming_healthy {
                reasons.push("quotes are not streamed by the broker");
            }
            format!("Connection is not healthy because {}.", reasons.join(" and "))
        };

        ConnectionHealthStatus {
            connected,
            connected_to_broker,
            quote_streaming_healthy,
            synchronized,
            healthy,
            message,
        }
    }

    /// Rolling 7-day uptime percentage in `[0, 100]`.
    #[must_use]
    pub fn uptime(&self) -> f64 {
        self.uptime
            .lock()
            .expect("uptime reservoir lock poisoned")
            .statistics()
            .average
    }

    #[cfg(test)]
    fn tick_once(&self) {
        check_quote_health(
            self.terminal_state.as_ref(),
            &self.quotes,
            self.min_quote_interval,
        )
        .expect("quote health tick");
        record_uptime(self.terminal_state.as_ref(), &self.quotes, &self.uptime)
            .expect("uptime tick");
    }
}

#[async_trait]
impl SyncListener for HealthMonitor {
    async fn on_symbol_price_updated(&self, price: &Value) -> Result<()> {
        let mut quotes = self.quotes.lock().expect("quote state lock poisoned");
        quotes.last_quote_at = Some(Instant::now());
        if let Some(quote_time) = price.get("time").and_then(crate::time::instant) {
            quotes.broker_offset = Utc::now() - quote_time;
        }
        Ok(())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Quote-health tick body.
fn check_quote_health(
    terminal_state: &dyn TerminalState,
    quotes: &Mutex<QuoteState>,
    min_quote_interval: Duration,
) -> Result<()> {
    let symbols = terminal_state.subscribed_symbols();

    let healthy = if symbols.is_empty() {
        true
    } else {
        let (offset, last_quote_at) = {
            let quotes = quotes.lock().expect("quote state lock poisoned");
            (quotes.broker_offset, quotes.last_quote_at)
        };
        // Broker wall clock reconstructed from the last quote timestamp.
        let server_now = Utc::now() - offset;
        let server_time = server_now.format("%H:%M:%S%.3f").to_string();
        let weekday = weekday_name(server_now.weekday());

        let in_session = symbols.iter().any(|symbol| {
            terminal_state
                .specification(symbol)
                .map_or(false, |specification| {
                    specification
                        .quote_sessions
                        .get(weekday)
                        .map_or(false, |sessions| {
                            sessions.iter().any(|session| {
                                session.from.as_str() <= server_time.as_str()
                                    && server_time.as_str() <= session.to.as_str()
                            })
                        })
                })
        });

        !in_session
            || last_quote_at.is_some_and(|at| at.elapsed() <= min_quote_interval)
    };

    quotes
        .lock()
        .expect("quote state lock poisoned")
        .quotes_healthy = healthy;
    Ok(())
}

/// Uptime tick body.
fn record_uptime(
    terminal_state: &dyn TerminalState,
    quotes: &Mutex<QuoteState>,
    uptime: &Mutex<StatisticalReservoir>,
) -> Result<()> {
    let quotes_healthy = quotes
        .lock()
        .expect("quote state lock poisoned")
        .quotes_healthy;
    let up = terminal_state.connected()
        && terminal_state.connected_to_broker()
        && terminal_state.synchronized()
        && quotes_healthy;

    uptime
        .lock()
        .expect("uptime reservoir lock poisoned")
        .record(if up { 100.0 } else { 0.0 });
    Ok(())
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Sun => "SUNDAY",
        Weekday::Mon => "MONDAY",
        Weekday::Tue => "TUESDAY",
        Weekday::Wed => "WEDNESDAY",
        Weekday::Thu => "THURSDAY",
        Weekday::Fri => "FRIDAY",
        Weekday::Sat => "SATURDAY",
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{QuoteSession, SymbolSpecification};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Terminal-state stub with settable flags and an optional all-day
    /// quote session for every subscribed symbol.
    struct FakeTerminal {
        connected: AtomicBool,
        connected_to_broker: AtomicBool,
        synchronized: AtomicBool,
        symbols: Vec<String>,
        all_day_sessions: bool,
    }

    impl FakeTerminal {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                connected_to_broker: AtomicBool::new(true),
                synchronized: AtomicBool::new(true),
                symbols: Vec::new(),
                all_day_sessions: false,
            }
        }

        fn with_symbol(mut self, symbol: &str, all_day_sessions: bool) -> Self {
            self.symbols.push(symbol.to_string());
            self.all_day_sessions = all_day_sessions;
            self
        }
    }

    impl TerminalState for FakeTerminal {
        fn connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn connected_to_broker(&self) -> bool {
            self.connected_to_broker.load(Ordering::SeqCst)
        }

        fn synchronized(&self) -> bool {
            self.synchronized.load(Ordering::SeqCst)
        }

        fn subscribed_symbols(&self) -> Vec<String> {
            self.symbols.clone()
        }

        fn specification(&self, _symbol: &str) -> Option<SymbolSpecification> {
            let mut quote_sessions = HashMap::new();
            if self.all_day_sessions {
                for weekday in [
                    "SUNDAY", "MONDAY", "TUESDAY", "WEDNESDAY", "THURSDAY", "FRIDAY", "SATURDAY",
                ] {
                    quote_sessions.insert(
                        weekday.to_string(),
                        vec![QuoteSession {
                            from: "00:00:00.000".to_string(),
                            to: "23:59:59.999".to_string(),
                        }],
                    );
                }
            }
            Some(SymbolSpecification { quote_sessions })
        }
    }

    // ── Health status composition ─────────────────────────────────────────

    #[test]
    fn test_healthy_when_all_flags_set() {
        let monitor = HealthMonitor::new("acc", Arc::new(FakeTerminal::new()));
        let status = monitor.health_status();
        assert!(status.healthy);
        assert_eq!(status.message, "Connection is healthy");
    }

    #[test]
    fn test_unsynchronized_message() {
        let terminal = FakeTerminal::new();
        terminal.synchronized.store(false, Ordering::SeqCst);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));

        let status = monitor.health_status();
        assert!(!status.healthy);
        assert_eq!(
            status.message,
            "Connection is not healthy because local terminal state is not synchronized to broker."
        );
    }

    #[test]
    fn test_multiple_reasons_joined_with_and() {
        let terminal = FakeTerminal::new();
        terminal.connected.store(false, Ordering::SeqCst);
        terminal.synchronized.store(false, Ordering::SeqCst);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));

        let status = monitor.health_status();
        assert_eq!(
            status.message,
            "Connection is not healthy because connection to API server is not established or \
             lost and local terminal state is not synchronized to broker."
        );
    }

    #[test]
    fn test_healthy_is_the_conjunction_of_the_four_flags() {
        let terminal = FakeTerminal::new();
        terminal.connected_to_broker.store(false, Ordering::SeqCst);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));

        let status = monitor.health_status();
        assert!(status.connected);
        assert!(!status.connected_to_broker);
        assert!(status.quote_streaming_healthy);
        assert!(status.synchronized);
        assert_eq!(
            status.healthy,
            status.connected
                && status.connected_to_broker
                && status.quote_streaming_healthy
                && status.synchronized
        );
        assert!(!status.healthy);
    }

    // ── Quote health ──────────────────────────────────────────────────────

    #[test]
    fn test_quotes_healthy_with_no_subscriptions() {
        let monitor = HealthMonitor::new("acc", Arc::new(FakeTerminal::new()));
        monitor.tick_once();
        assert!(monitor.health_status().quote_streaming_healthy);
    }

    #[test]
    fn test_quotes_healthy_outside_all_sessions() {
        // Subscribed, but the symbol has no quote sessions at all.
        let terminal = FakeTerminal::new().with_symbol("EURUSD", false);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));
        monitor.tick_once();
        assert!(monitor.health_status().quote_streaming_healthy);
    }

    #[tokio::test]
    async fn test_quotes_unhealthy_in_session_without_updates() {
        let terminal = FakeTerminal::new().with_symbol("EURUSD", true);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));
        monitor.tick_once();
        assert!(!monitor.health_status().quote_streaming_healthy);
        assert_eq!(
            monitor.health_status().message,
            "Connection is not healthy because quotes are not streamed by the broker."
        );
    }

    #[tokio::test]
    async fn test_recent_price_update_makes_quotes_healthy() {
        let terminal = FakeTerminal::new().with_symbol("EURUSD", true);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));

        let price = json!({
            "symbol": "EURUSD",
            "time": Utc::now().to_rfc3339(),
            "bid": 1.18,
            "ask": 1.19,
        });
        monitor.on_symbol_price_updated(&price).await.unwrap();
        monitor.tick_once();

        assert!(monitor.health_status().quote_streaming_healthy);
    }

    #[tokio::test]
    async fn test_stale_price_update_makes_quotes_unhealthy() {
        let terminal = FakeTerminal::new().with_symbol("EURUSD", true);
        let monitor =
            HealthMonitor::with_min_quote_interval("acc", Arc::new(terminal), Duration::ZERO);

        let price = json!({"symbol": "EURUSD", "time": Utc::now().to_rfc3339()});
        monitor.on_symbol_price_updated(&price).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        monitor.tick_once();

        assert!(!monitor.health_status().quote_streaming_healthy);
    }

    // ── Uptime ────────────────────────────────────────────────────────────

    #[test]
    fn test_uptime_stays_within_percentage_bounds() {
        let terminal = FakeTerminal::new();
        terminal.connected.store(false, Ordering::SeqCst);
        let monitor = HealthMonitor::new("acc", Arc::new(terminal));

        assert_eq!(monitor.uptime(), 0.0);
        monitor.tick_once();
        monitor.tick_once();
        let uptime = monitor.uptime();
        assert!((0.0..=100.0).contains(&uptime));
        assert_eq!(uptime, 0.0);
    }

    #[test]
    fn test_uptime_averages_up_and_down_ticks() {
        let terminal = Arc::new(FakeTerminal::new());
        let monitor = HealthMonitor::new("acc", Arc::clone(&terminal) as Arc<dyn TerminalState>);

        monitor.tick_once();
        terminal.connected.store(false, Ordering::SeqCst);
        monitor.tick_once();

        let uptime = monitor.uptime();
        assert!((0.0..=100.0).contains(&uptime));
        assert_eq!(uptime, 50.0);
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    #[test]
    fn test_weekday_names() {
        assert_eq!(weekday_name(Weekday::Sun), "SUNDAY");
        assert_eq!(weekday_name(Weekday::Sat), "SATURDAY");
        assert_eq!(weekday_name(Weekday::Wed), "WEDNESDAY");
    }
}
