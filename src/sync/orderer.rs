//! Per-account synchronization packet reordering.
//!
//! The gateway stamps every synchronization packet with a per-account
//! monotonically increasing `sequenceNumber`, but delivery order is not
//! guaranteed. [`PacketOrderer::restore_order`] buffers out-of-order packets
//! and releases them in strictly increasing sequence order:
//!
//! ```text
//! Gateway                              Orderer
//!   │  seq 5 (authenticated)              │ emit 5, expect 6
//!   │  seq 7 (accountInformation)         │ buffer 7
//!   │  seq 6 (status)                     │ emit 6, drain 7
//! ```
//!
//! A gap that is not filled within the gap timeout is unrecoverable (the
//! missing packet is gone, not late). The background tick then reports the
//! account on the out-of-order channel — the host re-subscribes, which
//! restarts the stream — and clears the account state so the next observed
//! sequence becomes the new baseline.

// Rust guideline compliant 2026-02

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::protocol::SyncPacket;

/// Default time a gap may stay unfilled before the stream is declared broken.
pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Background deadline-check cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Report emitted when an account's sequence gap timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfOrderReport {
    /// Account whose stream broke.
    pub account_id: String,
    /// Sequence number the orderer was waiting for.
    pub expected_sequence: u64,
    /// Earliest sequence number stuck in the wait buffer.
    pub observed_sequence: u64,
}

/// An out-of-order packet waiting for its gap to fill.
#[derive(Debug)]
struct BufferedPacket {
    packet: SyncPacket,
    received_at: Instant,
}

/// Reordering state of one account.
#[derive(Debug, Default)]
struct AccountSequence {
    /// Next sequence to emit. `None` until the first packet is observed.
    expected: Option<u64>,
    /// Out-of-order packets keyed by sequence number.
    buffer: BTreeMap<u64, BufferedPacket>,
}

type AccountMap = Arc<Mutex<HashMap<String, AccountSequence>>>;

/// Restores per-account sequence order over synchronization packets.
#[derive(Debug)]
pub struct PacketOrderer {
    accounts: AccountMap,
    report_tx: mpsc::UnboundedSender<OutOfOrderReport>,
    gap_timeout: Duration,
    tick: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PacketOrderer {
    /// Create an orderer and the channel its gap reports arrive on.
    #[must_use]
    pub fn new(gap_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<OutOfOrderReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        (
            Self {
                accounts: Arc::new(Mutex::new(HashMap::new())),
                report_tx,
                gap_timeout,
                tick: Mutex::new(None),
            },
            report_rx,
        )
    }

    /// Arm the background gap-deadline tick. Idempotent.
    pub fn start(&self) {
        let mut tick = self.tick.lock().expect("orderer tick lock poisoned");
        if tick.is_some() {
            return;
        }
        let accounts = Arc::clone(&self.accounts);
        let report_tx = self.report_tx.clone();
        let gap_timeout = self.gap_timeout;
        *tick = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                Self::check_gap_deadlines(&accounts, &report_tx, gap_timeout);
            }
        }));
    }

    /// Disarm the tick and clear all per-account state.
    pub fn stop(&self) {
        if let Some(task) = self.tick.lock().expect("orderer tick lock poisoned").take() {
            task.abort();
        }
        self.accounts
            .lock()
            .expect("orderer account lock poisoned")
            .clear();
    }

    /// Feed one packet in; get back zero or more packets in ascending
    /// sequence order.
    ///
    /// Packets without a sequence number bypass reordering unchanged.
    /// Duplicates (sequence below the next expected) are dropped.
    pub fn restore_order(&self, packet: SyncPacket) -> Vec<SyncPacket> {
        let Some(seq) = packet.sequence_number else {
            return vec![packet];
        };

        let mut accounts = self.accounts.lock().expect("orderer account lock poisoned");
        let state = accounts.entry(packet.account_id.clone()).or_default();

        match state.expected {
            None => {
                // First observed sequence becomes the baseline.
                state.expected = Some(seq + 1);
                let mut emitted = vec![packet];
                drain_ready(state, &mut emitted);
                emitted
            }
            Some(expected) if seq == expected => {
                state.expected = Some(seq + 1);
                let mut emitted = vec![packet];
                drain_ready(state, &mut emitted);
                emitted
            }
            Some(expected) if seq > expected => {
                log::debug!(
                    "buffering out-of-order packet for {}: got seq {}, waiting for {}",
                    packet.account_id,
                    seq,
                    expected
                );
                state.buffer.insert(
                    seq,
                    BufferedPacket {
                        packet,
                        received_at: Instant::now(),
                    },
                );
                Vec::new()
            }
            Some(expected) => {
                log::debug!(
                    "dropping duplicate packet for {}: seq {} < expected {}",
                    packet.account_id,
                    seq,
                    expected
                );
                Vec::new()
            }
        }
    }

    /// Declare gaps unrecoverable once any buffered packet has waited longer
    /// than `gap_timeout`, report them, and reset the account.
    ///
    /// The deadline derives from the oldest `received_at` in the buffer, not
    /// the smallest sequence number: a late packet with a lower sequence must
    /// not restart the wait for a gap that is already stale.
    fn check_gap_deadlines(
        accounts: &AccountMap,
        report_tx: &mpsc::UnboundedSender<OutOfOrderReport>,
        gap_timeout: Duration,
    ) {
        let mut reports = Vec::new();
        {
            let mut accounts = accounts.lock().expect("orderer account lock poisoned");
            let expired: Vec<String> = accounts
                .iter()
                .filter_map(|(account_id, state)| {
                    let oldest = state.buffer.values().min_by_key(|b| b.received_at)?;
                    (oldest.received_at.elapsed() > gap_timeout).then(|| account_id.clone())
                })
                .collect();

            for account_id in expired {
                if let Some(state) = accounts.remove(&account_id) {
                    let observed = state.buffer.keys().next().copied().unwrap_or_default();
                    reports.push(OutOfOrderReport {
                        account_id,
                        expected_sequence: state.expected.unwrap_or_default(),
                        observed_sequence: observed,
                    });
                }
            }
        }

        for report in reports {
            log::warn!(
                "sequence gap for {} not filled in {:?} (expected {}, observed {}), resetting stream",
                report.account_id,
                gap_timeout,
                report.expected_sequence,
                report.observed_sequence
            );
            // Receiver gone means the client is shutting down.
            let _ = report_tx.send(report);
        }
    }

    #[cfg(test)]
    fn sweep(&self) {
        Self::check_gap_deadlines(&self.accounts, &self.report_tx, self.gap_timeout);
    }
}

impl Drop for PacketOrderer {
    fn drop(&mut self) {
        if let Ok(mut tick) = self.tick.lock() {
            if let Some(task) = tick.take() {
                task.abort();
            }
        }
    }
}

/// Pull consecutive continuations out of the wait buffer.
fn drain_ready(state: &mut AccountSequence, emitted: &mut Vec<SyncPacket>) {
    let Some(mut expected) = state.expected else {
        return;
    };
    while let Some(buffered) = state.buffer.remove(&expected) {
        emitted.push(buffered.packet);
        expected += 1;
    }
    state.expected = Some(expected);
}

// ─── Tests ──────────────────────────────────────────────────────────────────
