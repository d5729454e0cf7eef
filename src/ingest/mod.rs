//! Ingestion adapters feeding the engine sink.
//!
//! Each adapter debounces by `event_key` and sits behind a circuit breaker;
//! a broken adapter stays quiet until its reset window passes and the twin
//! keeps running on last-known events.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{EventEnvelope, TrainClass, TrainEvent};
use crate::twin::minutes;

#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset: Duration,
    failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            reset,
            failures: 0,
            open_until: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.open_until = None;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.max_failures {
            self.open_until = Some(Instant::now() + self.reset);
        }
    }

    pub fn allow(&self) -> bool {
        match self.open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

/// Bounded first-seen filter over event keys.
#[derive(Debug)]
pub struct Deduper {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl Deduper {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// True when the key was already seen; records it otherwise.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        if self.order.len() > self.capacity {
            // prune the oldest half
            for _ in 0..self.capacity / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        false
    }
}

impl Default for Deduper {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Watches a JSONL file for appended `EventEnvelope` lines.
#[derive(Debug)]
pub struct FileDropAdapter {
    path: PathBuf,
    offset: usize,
    breaker: CircuitBreaker,
    deduper: Deduper,
}

impl FileDropAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            breaker: CircuitBreaker::default(),
            deduper: Deduper::default(),
        }
    }

    fn tick(&mut self) -> Vec<EventEnvelope> {
        if !self.breaker.allow() {
            return Vec::new();
        }
        if !self.path.exists() {
            self.breaker.record_success();
            return Vec::new();
        }
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "file drop read failed");
                self.breaker.record_failure();
                return Vec::new();
            }
        };
        let lines: Vec<&str> = text.lines().collect();
        let mut out = Vec::new();
        for line in lines.iter().skip(self.offset) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EventEnvelope>(line) {
                Ok(envelope) => {
                    if !self.deduper.check_and_insert(&envelope.event_key) {
                        out.push(envelope);
                    }
                }
                Err(e) => debug!(error = %e, "ignoring malformed envelope line"),
            }
        }
        self.offset = lines.len();
        self.breaker.record_success();
        out
    }
}

/// Polls a running-status endpoint returning a JSON array of envelopes.
#[derive(Debug)]
pub struct PollingStatusAdapter {
    url: Option<String>,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    deduper: Deduper,
}

impl PollingStatusAdapter {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url,
            client,
            breaker: CircuitBreaker::default(),
            deduper: Deduper::default(),
        }
    }

    async fn tick(&mut self) -> Vec<EventEnvelope> {
        let Some(url) = self.url.clone() else {
            return Vec::new();
        };
        if !self.breaker.allow() {
            return Vec::new();
        }
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "status poll failed");
                self.breaker.record_failure();
                return Vec::new();
            }
        };
        match response.json::<Vec<EventEnvelope>>().await {
            Ok(envelopes) => {
                self.breaker.record_success();
                envelopes
                    .into_iter()
                    .filter(|e| !self.deduper.check_and_insert(&e.event_key))
                    .collect()
            }
            Err(e) => {
                warn!(%url, error = %e, "status poll returned bad payload");
                self.breaker.record_failure();
                Vec::new()
            }
        }
    }
}

/// Adapters the engine ticks sequentially.
#[derive(Debug)]
pub enum Adapter {
    FileDrop(FileDropAdapter),
    Polling(PollingStatusAdapter),
}

impl Adapter {
    pub fn name(&self) -> &'static str {
        match self {
            Adapter::FileDrop(_) => "file_drop",
            Adapter::Polling(_) => "polling_running_status",
        }
    }

    pub async fn tick(&mut self) -> Vec<EventEnvelope> {
        match self {
            Adapter::FileDrop(adapter) => adapter.tick(),
            Adapter::Polling(adapter) => adapter.tick().await,
        }
    }
}

/// In-memory event set the sink merges envelopes into, idempotent by
/// `event_key`.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<TrainEvent>,
    seen_keys: HashSet<String>,
}

impl EventStore {
    pub fn new(events: Vec<TrainEvent>) -> Self {
        Self {
            events,
            seen_keys: HashSet::new(),
        }
    }

    pub fn events(&self) -> &[TrainEvent] {
        &self.events
    }

    pub fn events_cloned(&self) -> Vec<TrainEvent> {
        self.events.clone()
    }

    pub fn replace(&mut self, events: Vec<TrainEvent>) {
        self.events = events;
    }

    /// Apply one envelope; returns false when the key was already merged.
    pub fn merge(&mut self, envelope: &EventEnvelope) -> bool {
        if self.seen_keys.contains(&envelope.event_key) {
            return false;
        }
        self.seen_keys.insert(envelope.event_key.clone());
        let Some(station_id) = envelope.station_id.clone() else {
            return true;
        };
        let ts = envelope.ts;
        let position = self
            .events
            .iter()
            .position(|e| e.train_id == envelope.train_id && e.station_id == station_id);
        match envelope.event_type.as_str() {
            "arr" => match position {
                Some(i) => self.events[i].act_arr = Some(ts),
                None => self.events.push(live_event(envelope, &station_id, Some(ts), None)),
            },
            "dep" => match position {
                Some(i) => self.events[i].act_dep = Some(ts),
                None => self.events.push(live_event(envelope, &station_id, None, Some(ts))),
            },
            "eta" => {
                if let Some(i) = position {
                    if self.events[i].act_arr.is_none() {
                        self.events[i].act_arr = Some(ts);
                    }
                }
            }
            "hold" => {
                let held_minutes = envelope
                    .fields
                    .get("minutes")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                if held_minutes > 0.0 {
                    if let Some(i) = position {
                        let base = self.events[i].act_dep.or(self.events[i].sched_dep);
                        if let Some(base) = base {
                            self.events[i].act_dep = Some(base + minutes(held_minutes));
                        }
                    }
                }
            }
            other => debug!(event_type = other, "ignoring unsupported envelope type"),
        }
        true
    }
}

fn live_event(
    envelope: &EventEnvelope,
    station_id: &str,
    act_arr: Option<DateTime<Utc>>,
    act_dep: Option<DateTime<Utc>>,
) -> TrainEvent {
    TrainEvent {
        train_id: envelope.train_id.clone(),
        station_id: station_id.to_string(),
        service_date: envelope.ts.date_naive(),
        stop_seq: None,
        sched_arr: None,
        sched_dep: None,
        act_arr,
        act_dep,
        priority: 0,
        class: TrainClass::from_name(&envelope.train_id),
    }
}
