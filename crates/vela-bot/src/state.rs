//! Shared engine state with lock-free access.
//!
//! Pair workers run concurrently and share only what lives here: the
//! control flags, the in-flight trade registry and the metrics counters.
//! Everything is atomics or DashMap; no Mutex on the event path.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::warn;

use vela_common::CurrencyPair;

/// Shared state for the whole engine.
#[derive(Debug, Default)]
pub struct EngineState {
    /// Pause flags and warmup gate.
    pub control: ControlFlags,
    /// Pairs with a trade currently being executed.
    pub in_flight: InFlightRegistry,
    /// Counters for observability.
    pub metrics: MetricsCounters,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Global pause flags and the warmup gate.
///
/// All flags are atomics for lock-free access from every pair worker.
#[derive(Debug)]
pub struct ControlFlags {
    /// Blocks every action, including closes.
    trading_paused: AtomicBool,
    /// Blocks position-opening actions only.
    opening_paused: AtomicBool,
    /// Market time (ms) of the first observed event. 0 = nothing seen yet.
    first_event_ms: AtomicI64,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self {
            trading_paused: AtomicBool::new(false),
            opening_paused: AtomicBool::new(false),
            first_event_ms: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn is_trading_paused(&self) -> bool {
        self.trading_paused.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_trading_paused(&self, paused: bool) {
        self.trading_paused.store(paused, Ordering::Release);
    }

    #[inline]
    pub fn is_opening_paused(&self) -> bool {
        self.opening_paused.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_opening_paused(&self, paused: bool) {
        self.opening_paused.store(paused, Ordering::Release);
    }

    /// Record the market time of an observed event. The first call starts
    /// the warmup clock; later calls are no-ops.
    pub fn note_market_data(&self, market_time: DateTime<Utc>) {
        let ms = market_time.timestamp_millis();
        let _ = self.first_event_ms.compare_exchange(
            0,
            ms,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// True once `warmup_secs` of market time have passed since the first
    /// observed event. False while no event has been seen at all.
    pub fn warmup_complete(&self, now: DateTime<Utc>, warmup_secs: u64) -> bool {
        let first = self.first_event_ms.load(Ordering::Acquire);
        if first == 0 {
            return false;
        }
        now.timestamp_millis() - first >= (warmup_secs as i64) * 1000
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Pairs with a trade currently being executed, keyed to a hard deadline.
///
/// At most one trade per pair may be in flight. The deadline is the
/// deadlock guard: if a backend call never completes, the next attempt
/// after the deadline reclaims the slot instead of wedging the pair
/// forever.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    deadlines: DashMap<CurrencyPair, DateTime<Utc>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the in-flight slot for a pair. Returns false if a
    /// live (non-expired) trade already occupies it.
    pub fn try_begin(
        &self,
        pair: &CurrencyPair,
        now: DateTime<Utc>,
        timeout_secs: u64,
    ) -> bool {
        let deadline = now + Duration::seconds(timeout_secs as i64);
        match self.deadlines.entry(pair.clone()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(deadline);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() <= now {
                    warn!(
                        pair = %pair,
                        stale_deadline = %entry.get(),
                        "In-flight trade timed out, reclaiming slot"
                    );
                    entry.insert(deadline);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Release the slot after the backend call completes (success or
    /// failure).
    pub fn finish(&self, pair: &CurrencyPair) {
        self.deadlines.remove(pair);
    }

    /// True if a live trade occupies the pair's slot.
    pub fn is_in_flight(&self, pair: &CurrencyPair, now: DateTime<Utc>) -> bool {
        self.deadlines
            .get(pair)
            .map(|deadline| *deadline > now)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Counters for observability.
///
/// Relaxed ordering: exact cross-thread interleavings don't matter here.
#[derive(Debug, Default)]
pub struct MetricsCounters {
    /// Market events processed across all pairs.
    pub events_processed: AtomicU64,
    /// Actions strategies emitted.
    pub actions_emitted: AtomicU64,
    /// Actions the gateway dropped (pause / in-flight / warmup).
    pub actions_dropped: AtomicU64,
    /// Trades the backend confirmed.
    pub trades_executed: AtomicU64,
    /// Backend executions that failed.
    pub trades_failed: AtomicU64,
}

impl MetricsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_events(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_emitted(&self) {
        self.actions_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped(&self) {
        self.actions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_executed(&self) {
        self.trades_executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failed(&self) {
        self.trades_failed.fetch_add(1, Ordering::Relaxed);
    }
}
