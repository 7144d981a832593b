//! Per-endpoint rate-limit bookkeeping.
//!
//! Each tracked endpoint owns a window of `limit` requests that rolls over at
//! `reset_at`. Windows are updated from authoritative server metadata
//! (`reconcile_from_server`), from local optimistic accounting
//! (`optimistic_decrement`), and from the periodic `sweep`. The tracker never
//! issues requests and never fails: bad inputs are ignored or clamped.

use crate::clock::{Clock, SystemClock};
use crate::config::{EndpointConfig, LimitsConfig};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Tracker shared between callers and the sweep task.
pub type SharedTracker = Arc<Mutex<RateLimitTracker>>;

/// Lock a shared tracker. Poisoning is ignored: every mutation leaves the
/// windows clamped, so the state is usable after a panic elsewhere.
pub fn lock_tracker(shared: &SharedTracker) -> MutexGuard<'_, RateLimitTracker> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only view of one endpoint's window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointLimit {
    pub endpoint_name: String,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds.
    pub reset_at: i64,
    pub is_limited: bool,
}

#[derive(Debug, Clone)]
struct Window {
    limit: u32,
    remaining: u32,
    reset_at: i64,
    window_ms: u64,
}

impl Window {
    fn fresh(cfg: &EndpointConfig, now: i64) -> Self {
        Self {
            limit: cfg.limit,
            remaining: cfg.limit,
            reset_at: now.saturating_add(window_ms_i64(cfg.window_ms)),
            window_ms: cfg.window_ms,
        }
    }

    fn expired(&self, now: i64) -> bool {
        now >= self.reset_at
    }

    fn is_limited(&self, now: i64) -> bool {
        self.remaining == 0 && !self.expired(now)
    }

    /// Remaining as seen by queries: an expired window counts as full.
    fn effective_remaining(&self, now: i64) -> u32 {
        if self.expired(now) {
            self.limit
        } else {
            self.remaining
        }
    }

    fn roll_over(&mut self, now: i64) {
        self.remaining = self.limit;
        self.reset_at = now.saturating_add(window_ms_i64(self.window_ms));
    }
}

fn window_ms_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

pub struct RateLimitTracker {
    clock: Arc<dyn Clock>,
    windows: HashMap<String, Window>,
    limited_signal: Arc<Notify>,
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("windows", &self.windows)
            .finish_non_exhaustive()
    }
}

impl RateLimitTracker {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: &LimitsConfig, clock: Arc<dyn Clock>) -> Self {
        let mut tracker = Self {
            clock,
            windows: HashMap::new(),
            limited_signal: Arc::new(Notify::new()),
        };
        for ep in &cfg.endpoints {
            tracker.track(ep.clone());
        }
        tracker
    }

    pub fn into_shared(self) -> SharedTracker {
        Arc::new(Mutex::new(self))
    }

    /// Start tracking `cfg.name` with a full window. Re-tracking an existing
    /// name replaces its configuration.
    pub fn track(&mut self, cfg: EndpointConfig) {
        let now = self.now();
        debug!(
            "tracking endpoint {} (limit={}, window_ms={})",
            cfg.name, cfg.limit, cfg.window_ms
        );
        self.windows.insert(cfg.name.clone(), Window::fresh(&cfg, now));
    }

    /// Overwrite the endpoint's window with server-supplied values.
    ///
    /// A missing or non-positive `limit` means the server sent no usable
    /// metadata and leaves local state untouched. A missing `remaining` keeps
    /// the local count; a missing or non-positive reset keeps the local
    /// `reset_at`. The server always wins over optimistic counts.
    pub fn reconcile_from_server(
        &mut self,
        endpoint: &str,
        limit: Option<i64>,
        remaining: Option<i64>,
        reset_epoch_secs: Option<i64>,
    ) {
        let Some(limit) = limit.filter(|l| *l > 0) else {
            debug!("{}: no authoritative rate limit metadata", endpoint);
            return;
        };
        let now = self.now();
        let Some(w) = self.windows.get_mut(endpoint) else {
            debug!("{}: reconcile for untracked endpoint ignored", endpoint);
            return;
        };
        let was_limited = w.is_limited(now);
        w.limit = u32::try_from(limit).unwrap_or(u32::MAX);
        // An expired window's leftover count is stale; it reads as full.
        let remaining = remaining.unwrap_or(i64::from(w.effective_remaining(now)));
        w.remaining = u32::try_from(remaining.clamp(0, i64::from(w.limit))).unwrap_or(0);
        if let Some(secs) = reset_epoch_secs.filter(|s| *s > 0) {
            w.reset_at = secs.saturating_mul(1000);
        }
        let limited = w.is_limited(now);
        self.note_transition(endpoint, was_limited, limited);
    }

    /// Consume one request slot before the server has answered.
    pub fn optimistic_decrement(&mut self, endpoint: &str) {
        let now = self.now();
        let Some(w) = self.windows.get_mut(endpoint) else {
            debug!("{}: decrement for untracked endpoint ignored", endpoint);
            return;
        };
        let was_limited = w.is_limited(now);
        if w.expired(now) {
            w.roll_over(now);
        }
        w.remaining = w.remaining.saturating_sub(1);
        let limited = w.is_limited(now);
        self.note_transition(endpoint, was_limited, limited);
    }

    /// Mark the window exhausted after the server refused a request without
    /// sending rate metadata. With `retry_after_secs` the window reopens at
    /// that deadline; otherwise the current `reset_at` stands.
    pub fn mark_exhausted(&mut self, endpoint: &str, retry_after_secs: Option<u64>) {
        let now = self.now();
        let Some(w) = self.windows.get_mut(endpoint) else {
            debug!("{}: exhaust for untracked endpoint ignored", endpoint);
            return;
        };
        let was_limited = w.is_limited(now);
        if w.expired(now) {
            w.roll_over(now);
        }
        w.remaining = 0;
        if let Some(secs) = retry_after_secs.filter(|s| *s > 0) {
            let ms = i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000);
            w.reset_at = now.saturating_add(ms);
        }
        let limited = w.is_limited(now);
        self.note_transition(endpoint, was_limited, limited);
    }

    /// Restore full quota and start a new window.
    pub fn reset(&mut self, endpoint: &str) {
        let now = self.now();
        if let Some(w) = self.windows.get_mut(endpoint) {
            w.roll_over(now);
        }
    }

    /// Roll over every window whose reset time has passed. Returns how many
    /// endpoints were reset.
    pub fn sweep(&mut self) -> usize {
        let now = self.now();
        let mut count = 0;
        for (name, w) in self.windows.iter_mut() {
            if w.expired(now) {
                let was_limited = w.remaining == 0;
                w.roll_over(now);
                count += 1;
                if was_limited {
                    info!("{}: rate limit window reset ({} available)", name, w.limit);
                } else {
                    debug!("{}: window rolled over", name);
                }
            }
        }
        count
    }

    pub fn can_request(&self, endpoint: &str) -> bool {
        let now = self.now();
        match self.windows.get(endpoint) {
            Some(w) => w.expired(now) || w.remaining > 0,
            None => true,
        }
    }

    pub fn seconds_until_reset(&self, endpoint: &str) -> u64 {
        let now = self.now();
        let Some(w) = self.windows.get(endpoint) else {
            return 0;
        };
        let diff = w.reset_at.saturating_sub(now);
        if diff <= 0 {
            0
        } else {
            u64::try_from(diff).unwrap_or(0).div_ceil(1000)
        }
    }

    /// Share of the window already consumed, in `[0, 100]`.
    pub fn usage_percentage(&self, endpoint: &str) -> f64 {
        let now = self.now();
        let Some(w) = self.windows.get(endpoint) else {
            return 0.0;
        };
        if w.limit == 0 {
            return 0.0;
        }
        let used = w.limit - w.effective_remaining(now).min(w.limit);
        (f64::from(used) / f64::from(w.limit) * 100.0).clamp(0.0, 100.0)
    }

    pub fn remaining(&self, endpoint: &str) -> Option<u32> {
        let now = self.now();
        self.windows.get(endpoint).map(|w| w.effective_remaining(now))
    }

    pub fn limit(&self, endpoint: &str) -> Option<u32> {
        self.windows.get(endpoint).map(|w| w.limit)
    }

    pub fn is_limited(&self, endpoint: &str) -> bool {
        let now = self.now();
        self.windows
            .get(endpoint)
            .map(|w| w.is_limited(now))
            .unwrap_or(false)
    }

    pub fn any_limited(&self) -> bool {
        let now = self.now();
        self.windows.values().any(|w| w.is_limited(now))
    }

    pub fn snapshot(&self, endpoint: &str) -> Option<EndpointLimit> {
        let now = self.now();
        self.windows
            .get(endpoint)
            .map(|w| Self::view(endpoint, w, now))
    }

    /// Snapshots of every tracked endpoint, sorted by name.
    pub fn snapshots(&self) -> Vec<EndpointLimit> {
        let now = self.now();
        let mut out: Vec<_> = self
            .windows
            .iter()
            .map(|(name, w)| Self::view(name, w, now))
            .collect();
        out.sort_by(|a, b| a.endpoint_name.cmp(&b.endpoint_name));
        out
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<_> = self.windows.keys().cloned().collect();
        names.sort();
        names
    }

    /// Signalled whenever an endpoint enters the limited state.
    pub(crate) fn limited_signal(&self) -> Arc<Notify> {
        self.limited_signal.clone()
    }

    fn view(name: &str, w: &Window, now: i64) -> EndpointLimit {
        EndpointLimit {
            endpoint_name: name.to_string(),
            limit: w.limit,
            remaining: w.effective_remaining(now),
            reset_at: w.reset_at,
            is_limited: w.is_limited(now),
        }
    }

    fn note_transition(&self, endpoint: &str, was_limited: bool, limited: bool) {
        if limited {
            if !was_limited {
                info!(
                    "{}: rate limited for {}s",
                    endpoint,
                    self.seconds_until_reset(endpoint)
                );
            }
            self.limited_signal.notify_one();
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ANALYZE_CHART;

    const T0: i64 = 1_700_000_000_000;

    fn tracker(limit: u32, window_ms: u64) -> (RateLimitTracker, ManualClock) {
        let clock = ManualClock::new(T0);
        let cfg = LimitsConfig {
            endpoints: vec![EndpointConfig::new(ANALYZE_CHART, limit, window_ms)],
        };
        (RateLimitTracker::with_clock(&cfg, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn fresh_window_is_full() {
        let (t, _) = tracker(10, 60_000);
        assert!(t.can_request(ANALYZE_CHART));
        assert_eq!(t.usage_percentage(ANALYZE_CHART), 0.0);
        assert_eq!(t.remaining(ANALYZE_CHART), Some(10));
        assert_eq!(t.seconds_until_reset(ANALYZE_CHART), 60);
        assert!(!t.any_limited());
    }

    #[test]
    fn decrement_floors_at_zero() {
        let (mut t, _) = tracker(2, 60_000);
        for _ in 0..5 {
            t.optimistic_decrement(ANALYZE_CHART);
        }
        assert_eq!(t.remaining(ANALYZE_CHART), Some(0));
        assert!(t.is_limited(ANALYZE_CHART));
        assert!(!t.can_request(ANALYZE_CHART));
    }

    #[test]
    fn decrement_after_expiry_starts_new_window() {
        let (mut t, clock) = tracker(3, 1_000);
        t.optimistic_decrement(ANALYZE_CHART);
        t.optimistic_decrement(ANALYZE_CHART);
        clock.advance(1_500);
        t.optimistic_decrement(ANALYZE_CHART);
        assert_eq!(t.remaining(ANALYZE_CHART), Some(2));
        assert_eq!(t.snapshot(ANALYZE_CHART).unwrap().reset_at, T0 + 2_500);
    }

    #[test]
    fn reconcile_clamps_remaining() {
        let (mut t, _) = tracker(10, 60_000);
        t.reconcile_from_server(ANALYZE_CHART, Some(5), Some(50), Some(T0 / 1000 + 10));
        assert_eq!(t.limit(ANALYZE_CHART), Some(5));
        assert_eq!(t.remaining(ANALYZE_CHART), Some(5));
        t.reconcile_from_server(ANALYZE_CHART, Some(5), Some(-3), None);
        assert_eq!(t.remaining(ANALYZE_CHART), Some(0));
        assert!(t.is_limited(ANALYZE_CHART));
    }

    #[test]
    fn reconcile_server_wins_over_optimistic_count() {
        let (mut t, _) = tracker(10, 60_000);
        for _ in 0..4 {
            t.optimistic_decrement(ANALYZE_CHART);
        }
        t.reconcile_from_server(ANALYZE_CHART, Some(10), Some(9), Some(T0 / 1000 + 60));
        assert_eq!(t.remaining(ANALYZE_CHART), Some(9));
    }

    #[test]
    fn reconcile_without_remaining_keeps_local_count() {
        let (mut t, _) = tracker(10, 60_000);
        t.optimistic_decrement(ANALYZE_CHART);
        t.reconcile_from_server(ANALYZE_CHART, Some(20), None, None);
        assert_eq!(t.limit(ANALYZE_CHART), Some(20));
        assert_eq!(t.remaining(ANALYZE_CHART), Some(9));
        assert_eq!(t.snapshot(ANALYZE_CHART).unwrap().reset_at, T0 + 60_000);
    }

    #[test]
    fn reconcile_after_expiry_does_not_revive_stale_count() {
        let (mut t, clock) = tracker(10, 60_000);
        for _ in 0..10 {
            t.optimistic_decrement(ANALYZE_CHART);
        }
        clock.advance(60_001);
        assert!(t.can_request(ANALYZE_CHART));
        t.reconcile_from_server(
            ANALYZE_CHART,
            Some(10),
            None,
            Some(clock.now_ms() / 1000 + 200),
        );
        assert_eq!(t.remaining(ANALYZE_CHART), Some(10));
        assert!(t.can_request(ANALYZE_CHART));
        assert!(!t.is_limited(ANALYZE_CHART));
    }

    #[test]
    fn mark_exhausted_blocks_until_retry_after() {
        let (mut t, clock) = tracker(10, 60_000);
        t.mark_exhausted(ANALYZE_CHART, Some(20));
        assert!(!t.can_request(ANALYZE_CHART));
        assert_eq!(t.seconds_until_reset(ANALYZE_CHART), 20);
        clock.advance(20_000);
        assert!(t.can_request(ANALYZE_CHART));

        // Without a deadline the current window end is kept.
        t.sweep();
        t.mark_exhausted(ANALYZE_CHART, None);
        assert!(t.is_limited(ANALYZE_CHART));
        assert_eq!(t.seconds_until_reset(ANALYZE_CHART), 60);
    }

    #[test]
    fn untracked_endpoints_are_permissive() {
        let (mut t, _) = tracker(1, 1_000);
        t.optimistic_decrement("unknown");
        t.reconcile_from_server("unknown", Some(1), Some(0), None);
        assert!(t.can_request("unknown"));
        assert_eq!(t.seconds_until_reset("unknown"), 0);
        assert_eq!(t.usage_percentage("unknown"), 0.0);
        assert!(t.snapshot("unknown").is_none());
    }

    #[test]
    fn zero_limit_usage_is_zero() {
        let (mut t, _) = tracker(1, 1_000);
        t.track(EndpointConfig::new("broken", 0, 1_000));
        assert_eq!(t.usage_percentage("broken"), 0.0);
    }

    #[test]
    fn sweep_resets_only_expired_windows() {
        let (mut t, clock) = tracker(2, 1_000);
        t.track(EndpointConfig::new("slow", 2, 10_000));
        t.optimistic_decrement(ANALYZE_CHART);
        t.optimistic_decrement(ANALYZE_CHART);
        t.optimistic_decrement("slow");
        clock.advance(1_000);
        assert_eq!(t.sweep(), 1);
        assert_eq!(t.remaining(ANALYZE_CHART), Some(2));
        assert_eq!(t.remaining("slow"), Some(1));
        let snap = t.snapshot(ANALYZE_CHART).unwrap();
        assert_eq!(snap.reset_at, T0 + 2_000);
        assert!(!snap.is_limited);
    }

    #[test]
    fn manual_reset_restores_quota() {
        let (mut t, _) = tracker(1, 60_000);
        t.optimistic_decrement(ANALYZE_CHART);
        assert!(!t.can_request(ANALYZE_CHART));
        t.reset(ANALYZE_CHART);
        assert!(t.can_request(ANALYZE_CHART));
    }

    #[test]
    fn snapshots_are_sorted() {
        let t = RateLimitTracker::with_clock(
            &LimitsConfig::default(),
            Arc::new(ManualClock::new(T0)),
        );
        let names: Vec<_> = t.snapshots().into_iter().map(|s| s.endpoint_name).collect();
        assert_eq!(names, vec!["analyze-chart", "analyze-market", "market-data"]);
        assert_eq!(t.endpoints(), names);
    }
}
