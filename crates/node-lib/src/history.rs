//! Replayable trace of control decisions
//!
//! Records are kept per service until read; a read hands them over and
//! forgets them.

use crate::models::HistoryData;
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

/// Default number of records retained per service (one day at a 10s period)
pub const DEFAULT_MAX_RECORDS: usize = 8640;

/// Per-service bounded history of allocation decisions
#[derive(Debug)]
pub struct History {
    records: DashMap<String, VecDeque<HistoryData>>,
    max_records: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl History {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_records: max_records.max(1),
        }
    }

    pub fn add_service(&self, service: &str) {
        self.records.entry(service.to_string()).or_default();
    }

    /// Forget a service and its unread records
    pub fn remove_service(&self, service: &str) {
        self.records.remove(service);
    }

    /// Append one record; the oldest record is evicted when full
    pub fn add_data(&self, service: &str, data: HistoryData) {
        let Some(mut records) = self.records.get_mut(service) else {
            return;
        };
        if records.len() >= self.max_records {
            records.pop_front();
            debug!(service = %service, "History full, evicted oldest record");
        }
        records.push_back(data);
    }

    /// Return every record since the last read and clear them
    pub fn read(&self, service: &str) -> Vec<HistoryData> {
        self.records
            .get_mut(service)
            .map(|mut records| records.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.records.contains_key(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MonitoringData;

    fn record(epoch: u64) -> HistoryData {
        HistoryData {
            epoch,
            timestamp_ms: epoch as i64 * 1000,
            monitoring: MonitoringData::default(),
            allocation: 1,
            optimal_allocation: 1.0,
            infeasible: false,
        }
    }

    #[test]
    fn test_read_consumes_records() {
        let history = History::default();
        history.add_service("a");
        history.add_data("a", record(1));
        history.add_data("a", record(2));

        let first = history.read("a");
        assert_eq!(first.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![1, 2]);
        assert!(history.read("a").is_empty());
    }

    #[test]
    fn test_bounded_per_service() {
        let history = History::new(3);
        history.add_service("a");
        for epoch in 1..=5 {
            history.add_data("a", record(epoch));
        }

        let epochs: Vec<u64> = history.read("a").iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![3, 4, 5]);
    }

    #[test]
    fn test_unknown_and_removed_services() {
        let history = History::default();
        history.add_data("ghost", record(1));
        assert!(history.read("ghost").is_empty());

        history.add_service("a");
        history.add_data("a", record(1));
        history.remove_service("a");
        assert!(!history.contains("a"));
        assert!(history.read("a").is_empty());
    }
}
