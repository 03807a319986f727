//! Per-service run summary built from the node history

use crate::output::{format_ms, format_allocation};
use node_lib::{HistoryData, Service};
use serde::Serialize;
use tabled::Tabled;

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct ServiceSummary {
    #[tabled(rename = "SERVICE")]
    pub service: String,
    #[tabled(rename = "TARGET RT")]
    pub target_rt: String,
    #[tabled(rename = "TICKS")]
    pub ticks: usize,
    #[tabled(rename = "COMPLETED")]
    pub completed: u64,
    #[tabled(rename = "MEAN RT")]
    pub mean_rt: String,
    #[tabled(rename = "MIN ALLOC")]
    pub min_allocation: u32,
    #[tabled(rename = "MAX ALLOC")]
    pub max_allocation: u32,
    #[tabled(rename = "LAST OPTIMAL")]
    pub last_optimal: String,
    #[tabled(rename = "UNREACHABLE")]
    pub infeasible_ticks: usize,
    #[tabled(skip)]
    #[serde(skip)]
    pub mean_rt_ms: f64,
}

/// Summarize the ticks recorded for one service
pub fn summarize(service: &Service, history: &[HistoryData]) -> ServiceSummary {
    let completed: u64 = history.iter().map(|h| h.monitoring.requests).sum();
    let weighted: f64 = history
        .iter()
        .map(|h| h.monitoring.response_time_ms * h.monitoring.requests as f64)
        .sum();
    let mean_rt_ms = if completed > 0 {
        weighted / completed as f64
    } else {
        0.0
    };

    ServiceSummary {
        service: service.name.clone(),
        target_rt: format_ms(service.target_rt_ms),
        ticks: history.len(),
        completed,
        mean_rt: format_ms(mean_rt_ms),
        min_allocation: history.iter().map(|h| h.allocation).min().unwrap_or(0),
        max_allocation: history.iter().map(|h| h.allocation).max().unwrap_or(0),
        last_optimal: history
            .last()
            .map(|h| format!("{:.2}", h.optimal_allocation))
            .unwrap_or_else(|| format_allocation(0.0)),
        infeasible_ticks: history.iter().filter(|h| h.infeasible).count(),
        mean_rt_ms,
    }
}
