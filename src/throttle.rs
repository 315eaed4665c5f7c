use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct EventLimit {
    pub per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub window: Duration,
    pub burst_window: Duration,
    pub default_limit: EventLimit,
    /// Per-event-type ceilings; event types not listed here fall back to
    /// `default_limit`.
    pub overrides: HashMap<String, EventLimit>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert(
            "typing".to_string(),
            EventLimit {
                per_second: 5,
                burst: 3,
            },
        );
        overrides.insert(
            "conversation-event".to_string(),
            EventLimit {
                per_second: 10,
                burst: 5,
            },
        );
        ThrottleConfig {
            window: Duration::from_millis(1000),
            burst_window: Duration::from_millis(100),
            default_limit: EventLimit {
                per_second: 20,
                burst: 10,
            },
            overrides,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub per_second: u32,
    pub burst: u32,
}

/// Per-event-type rate limiter. Windows are measured from the last reset,
/// not wall-clock aligned: counters roll over lazily on the next check, so
/// the ceilings are approximate rather than true sliding windows. Events
/// over either ceiling are dropped, never queued.
pub struct EventThrottler {
    config: ThrottleConfig,
    window_counts: HashMap<String, u32>,
    burst_counts: HashMap<String, u32>,
    window_started: Instant,
    burst_started: Instant,
}

impl EventThrottler {
    pub fn new(config: ThrottleConfig) -> Self {
        let now = Instant::now();
        EventThrottler {
            config,
            window_counts: HashMap::new(),
            burst_counts: HashMap::new(),
            window_started: now,
            burst_started: now,
        }
    }

    fn limit_for(&self, event_type: &str) -> EventLimit {
        self.config
            .overrides
            .get(event_type)
            .copied()
            .unwrap_or(self.config.default_limit)
    }

    fn roll_windows(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.window_started) >= self.config.window {
            self.window_counts.clear();
            self.window_started = now;
        }
        if now.duration_since(self.burst_started) >= self.config.burst_window {
            self.burst_counts.clear();
            self.burst_started = now;
        }
    }

    /// True iff neither counter for `event_type` has reached its ceiling in
    /// the current window. Rolls expired windows over as a side effect.
    pub fn can_process(&mut self, event_type: &str) -> bool {
        self.roll_windows();
        let limit = self.limit_for(event_type);
        let in_window = self.window_counts.get(event_type).copied().unwrap_or(0);
        let in_burst = self.burst_counts.get(event_type).copied().unwrap_or(0);
        in_window < limit.per_second && in_burst < limit.burst
    }

    /// Must follow a `can_process` that returned true; split out from
    /// `process_event` for testability.
    pub fn record(&mut self, event_type: &str) {
        *self
            .window_counts
            .entry(event_type.to_string())
            .or_insert(0) += 1;
        *self.burst_counts.entry(event_type.to_string()).or_insert(0) += 1;
    }

    /// Check, record and invoke in one call; returns whether the handler
    /// ran. This is the entry point production callers use.
    pub fn process_event<T>(
        &mut self,
        event_type: &str,
        data: T,
        handler: impl FnOnce(T),
    ) -> bool {
        if !self.can_process(event_type) {
            debug!("throttled {event_type} event");
            return false;
        }
        self.record(event_type);
        handler(data);
        true
    }

    pub fn stats(&self) -> HashMap<String, EventStats> {
        let mut stats: HashMap<String, EventStats> = HashMap::new();
        for (event_type, count) in &self.window_counts {
            stats.entry(event_type.clone()).or_default().per_second = *count;
        }
        for (event_type, count) in &self.burst_counts {
            stats.entry(event_type.clone()).or_default().burst = *count;
        }
        stats
    }

    pub fn reset(&mut self) {
        self.window_counts.clear();
        self.burst_counts.clear();
        let now = Instant::now();
        self.window_started = now;
        self.burst_started = now;
    }
}
