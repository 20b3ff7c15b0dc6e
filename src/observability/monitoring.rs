//! Monitoring counters: `panic.recover`, `query.<proto>.forward`, and
//! `query.<proto>.error` incremented under a mutex, drained by a
//! 60-second send loop. The wire protocol to the actual monitoring target
//! is a separate concern, so the network leg is a stubbed collaborator
//! trait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

/// The full set of counters this proxy reports, so the send loop can emit
/// an explicit zero for anything not incremented during an interval.
const KNOWN_COUNTERS: &[&str] = &[
    "panic.recover",
    "query.doh.forward",
    "query.dot.forward",
    "query.doq.forward",
    "query.doh.error",
    "query.dot.error",
    "query.doq.error",
];

/// Where a drained batch of counters is sent. `ServerConfig.zabbix_server`
/// selects the concrete implementation; the Zabbix wire protocol itself is
/// an external collaborator not specified here.
#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn send(&self, batch: &HashMap<String, u64>);
}

/// A sink that only logs what it would have sent, used when no
/// `zabbix_server` is configured or as the basis for a real
/// implementation.
pub struct LoggingSink;

#[async_trait]
impl MonitoringSink for LoggingSink {
    async fn send(&self, batch: &HashMap<String, u64>) {
        tracing::debug!(?batch, "monitoring send loop tick");
    }
}

pub struct Monitoring {
    counts: Mutex<HashMap<String, u64>>,
}

impl Monitoring {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment_panic_recover(&self) {
        self.increment("panic.recover");
    }

    pub fn increment_forward(&self, proto: &str) {
        self.increment(&format!("query.{proto}.forward"));
    }

    pub fn increment_error(&self, proto: &str) {
        self.increment(&format!("query.{proto}.error"));
    }

    fn increment(&self, key: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Drain the counter map, filling in zero for any known counter that
    /// wasn't incremented this interval, plus an "alive" heartbeat.
    fn drain(&self) -> HashMap<String, u64> {
        let mut counts = self.counts.lock().unwrap();
        let mut batch: HashMap<String, u64> = std::mem::take(&mut *counts);
        for key in KNOWN_COUNTERS {
            batch.entry((*key).to_string()).or_insert(0);
        }
        batch.insert("alive".to_string(), 1);
        batch
    }

    /// Spawn the 60-second drain loop. Best-effort and non-fatal: errors
    /// from `sink.send` are not surfaced to the supervisor.
    pub fn start_send_loop(
        self: std::sync::Arc<Self>,
        sink: std::sync::Arc<dyn MonitoringSink>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let batch = self.drain();
                sink.send(&batch).await;
            }
        })
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_includes_zeroed_known_counters_and_heartbeat() {
        let monitoring = Monitoring::new();
        monitoring.increment_forward("dot");
        monitoring.increment_forward("dot");
        monitoring.increment_error("doh");

        let batch = monitoring.drain();
        assert_eq!(batch.get("query.dot.forward"), Some(&2));
        assert_eq!(batch.get("query.doh.error"), Some(&1));
        assert_eq!(batch.get("query.doq.forward"), Some(&0));
        assert_eq!(batch.get("panic.recover"), Some(&0));
        assert_eq!(batch.get("alive"), Some(&1));
    }

    #[test]
    fn drain_resets_counters() {
        let monitoring = Monitoring::new();
        monitoring.increment_panic_recover();
        let _ = monitoring.drain();
        let second = monitoring.drain();
        assert_eq!(second.get("panic.recover"), Some(&0));
    }
}
