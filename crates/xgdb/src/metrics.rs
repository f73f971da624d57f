//! Protocol metrics using metrics-rs.
//!
//! Counters are recorded through the global `metrics` facade. When no recorder
//! is installed they are no-ops. `SummaryRecorder` keeps them in memory so the
//! CLI can print a summary when the server exits.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit, counter,
    describe_counter,
};
use parking_lot::RwLock;

// ============================================================================
// Metric descriptions
// ============================================================================

/// Register metric descriptions. Call once at startup.
pub fn init() {
    describe_counter!(
        "xgdb_sessions_total",
        Unit::Count,
        "Debugger client sessions accepted"
    );
    describe_counter!(
        "xgdb_packets_received_total",
        Unit::Count,
        "Well-formed packets received from the client"
    );
    describe_counter!(
        "xgdb_packets_rejected_total",
        Unit::Count,
        "Packets answered with a negative acknowledgement"
    );
    describe_counter!(
        "xgdb_replies_sent_total",
        Unit::Count,
        "Reply packets sent to the client"
    );
    describe_counter!(
        "xgdb_notifications_sent_total",
        Unit::Count,
        "Stop notifications delivered to the client"
    );
    describe_counter!(
        "xgdb_notifications_coalesced_total",
        Unit::Count,
        "Stop notifications replaced before delivery"
    );
}

// ============================================================================
// Metric recording functions
// ============================================================================

pub fn record_session() {
    counter!("xgdb_sessions_total").increment(1);
}

/// Count one received packet, labelled by verb.
pub fn record_packet(verb: &str) {
    let labels = [("verb", verb.to_string())];
    counter!("xgdb_packets_received_total", &labels).increment(1);
}

pub fn record_rejected() {
    counter!("xgdb_packets_rejected_total").increment(1);
}

pub fn record_reply() {
    counter!("xgdb_replies_sent_total").increment(1);
}

pub fn record_notification() {
    counter!("xgdb_notifications_sent_total").increment(1);
}

pub fn record_notification_coalesced() {
    counter!("xgdb_notifications_coalesced_total").increment(1);
}

// ============================================================================
// Summary recorder
// ============================================================================

#[derive(Default)]
struct CounterStorage {
    values: RwLock<HashMap<String, u64>>,
}

struct SummaryCounter {
    key: String,
    storage: Arc<CounterStorage>,
}

impl metrics::CounterFn for SummaryCounter {
    fn increment(&self, value: u64) {
        let mut values = self.storage.values.write();
        *values.entry(self.key.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        let mut values = self.storage.values.write();
        values.insert(self.key.clone(), value);
    }
}

/// In-memory recorder for counters. Gauges and histograms are discarded.
#[derive(Default)]
pub struct SummaryRecorder {
    counters: Arc<CounterStorage>,
}

impl SummaryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that reads this recorder's values without installing it.
    #[must_use]
    pub fn handle(&self) -> SummaryHandle {
        SummaryHandle {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Install as the global recorder.
    ///
    /// Returns `None` if a global recorder is already installed.
    pub fn install(self) -> Option<SummaryHandle> {
        let handle = self.handle();
        metrics::set_global_recorder(self).ok()?;
        Some(handle)
    }
}

fn key_to_string(key: &Key) -> String {
    let name = key.name();
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        name.to_string()
    } else {
        format!("{}{{{}}}", name, labels.join(","))
    }
}

impl Recorder for SummaryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(SummaryCounter {
            key: key_to_string(key),
            storage: Arc::clone(&self.counters),
        }))
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Read access to the counters of a [`SummaryRecorder`].
#[derive(Clone)]
pub struct SummaryHandle {
    counters: Arc<CounterStorage>,
}

impl SummaryHandle {
    #[must_use]
    pub fn get_counter(&self, key: &str) -> Option<u64> {
        self.counters.values.read().get(key).copied()
    }

    /// Sum of a counter across all label sets.
    #[must_use]
    pub fn total(&self, name: &str) -> u64 {
        self.counters
            .values
            .read()
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix(name)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('{'))
            })
            .map(|(_, value)| value)
            .sum()
    }

    pub fn print_summary(&self) {
        let counters = self.counters.values.read();
        if counters.is_empty() {
            println!("No metrics collected.");
            return;
        }

        println!();
        println!("## Protocol Summary");
        println!();
        let mut keys: Vec<_> = counters.keys().collect();
        keys.sort();
        for key in keys {
            if let Some(value) = counters.get(key) {
                println!("  {key}: {value}");
            }
        }
        println!();
    }
}
