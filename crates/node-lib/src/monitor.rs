//! Per-service completion statistics for the current control period

use crate::models::MonitoringData;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Running counters of one service
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    requests: u64,
    response_time_ms: f64,
    service_time_ms: f64,
}

impl Counters {
    fn snapshot(&self) -> MonitoringData {
        if self.requests == 0 {
            return MonitoringData::default();
        }
        let n = self.requests as f64;
        MonitoringData {
            requests: self.requests,
            response_time_ms: self.response_time_ms / n,
            service_time_ms: self.service_time_ms / n,
        }
    }
}

/// Monitoring aggregator shared by all executors of a node
///
/// Each completion lands in exactly one period: `read` swaps a service's
/// counters for zeroes while holding that service's slot.
#[derive(Debug, Default)]
pub struct Monitor {
    slots: DashMap<String, Counters>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, service: &str) {
        self.slots.entry(service.to_string()).or_default();
    }

    /// Deregister a service, discarding unread counts
    pub fn remove_service(&self, service: &str) {
        if let Some((_, counters)) = self.slots.remove(service) {
            if counters.requests > 0 {
                debug!(service = %service, discarded = counters.requests, "Discarding unread completions");
            }
        }
    }

    /// Record one completed request; ignored for unknown services
    pub fn record_completion(&self, service: &str, response_time: Duration, service_time: Duration) {
        if let Some(mut slot) = self.slots.get_mut(service) {
            slot.requests += 1;
            slot.response_time_ms += duration_ms(response_time);
            slot.service_time_ms += duration_ms(service_time);
        }
    }

    /// Close the current period: return every registered service's
    /// statistics and reset them
    pub fn read(&self) -> HashMap<String, MonitoringData> {
        self.slots
            .iter_mut()
            .map(|mut slot| {
                let closed = std::mem::take(slot.value_mut());
                (slot.key().clone(), closed.snapshot())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
