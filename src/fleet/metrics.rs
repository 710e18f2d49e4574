use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::PartitionKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetMetrics {
    pub started_at: DateTime<Utc>,
    pub workers_spawned: u64,
    pub workers_exited: u64,
    pub respawns_scheduled: u64,
    pub signals_relayed: u64,
    pub signal_deliveries: u64,
    pub partitions: HashMap<String, PartitionMetrics>,
    pub last_exit: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionMetrics {
    pub grants: u64,
    pub rejections: u64,
    pub abandoned: u64,
    pub last_nonce: Option<u64>,
}

impl FleetMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            workers_spawned: 0,
            workers_exited: 0,
            respawns_scheduled: 0,
            signals_relayed: 0,
            signal_deliveries: 0,
            partitions: HashMap::new(),
            last_exit: None,
            last_updated: now,
        }
    }

    pub fn record_spawn(&mut self) {
        self.workers_spawned += 1;
        self.last_updated = Utc::now();
    }

    pub fn record_exit(&mut self, description: String, respawn: bool) {
        self.workers_exited += 1;
        if respawn {
            self.respawns_scheduled += 1;
        }
        self.last_exit = Some(description);
        self.last_updated = Utc::now();
    }

    pub fn record_signal(&mut self, deliveries: usize) {
        self.signals_relayed += 1;
        self.signal_deliveries += deliveries as u64;
        self.last_updated = Utc::now();
    }

    pub fn record_grant(&mut self, key: &PartitionKey, nonce: u64) {
        let metrics = self.partition(key);
        metrics.grants += 1;
        metrics.last_nonce = Some(nonce);
        self.last_updated = Utc::now();
    }

    pub fn record_rejection(&mut self, key: &PartitionKey) {
        self.partition(key).rejections += 1;
        self.last_updated = Utc::now();
    }

    pub fn record_abandoned(&mut self, key: &PartitionKey) {
        self.partition(key).abandoned += 1;
        self.last_updated = Utc::now();
    }

    fn partition(&mut self, key: &PartitionKey) -> &mut PartitionMetrics {
        self.partitions.entry(key.to_string()).or_default()
    }

    pub fn generate_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Fleet Metrics Report ===\n");
        report.push_str(&format!(
            "Uptime: {} seconds\n",
            (Utc::now() - self.started_at).num_seconds()
        ));
        report.push_str(&format!("Workers Spawned: {}\n", self.workers_spawned));
        report.push_str(&format!("Workers Exited: {}\n", self.workers_exited));
        report.push_str(&format!("Respawns Scheduled: {}\n", self.respawns_scheduled));
        report.push_str(&format!(
            "Signals Relayed: {} ({} deliveries)\n",
            self.signals_relayed, self.signal_deliveries
        ));

        if let Some(ref exit) = self.last_exit {
            report.push_str(&format!("Last Exit: {}\n", exit));
        }

        report.push_str("\n=== Partitions ===\n");
        for (key, metrics) in &self.partitions {
            report.push_str(&format!(
                "{}: {} grants, {} rejections, {} abandoned, last nonce {:?}\n",
                key, metrics.grants, metrics.rejections, metrics.abandoned, metrics.last_nonce
            ));
        }

        report.push_str(&format!("\nLast Updated: {}\n", self.last_updated));
        report
    }

    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize metrics: {}", e))
    }
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}
