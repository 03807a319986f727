//! Allocation controller
//!
//! Keeps one exponential smoothing filter per service and turns each
//! monitoring snapshot into a set of allocations that fits the node's
//! memory budget.

use crate::models::{MonitoringData, Service};
use crate::planner::{self, NOMINAL_SERVICE_SHARE};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Smallest pool a registered service is given when memory allows it
pub const MIN_VIABLE_ALLOCATION: u32 = 1;

/// Controller decision for one service
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Allocation {
    /// Workers the executor receives
    pub applied: u32,
    /// Filter output before clamping
    pub recommended: f64,
    /// The estimator could not meet the target with any pool size
    pub infeasible: bool,
}

#[derive(Debug)]
struct Filter {
    service: Service,
    recommendation: f64,
}

/// Budget bookkeeping for one service during a control step
struct Candidate<'a> {
    name: &'a str,
    footprint: u64,
    recommended: f64,
    clamped: u32,
    applied: u32,
}

/// Feedback allocation controller
///
/// A service's `target_allocation` hint is already a pool size, not a load
/// figure. Open loop applies it as given and every filter starts from it;
/// callers that only know an arrival rate turn it into a hint with
/// `NodeFacade::get_static_allocation`.
///
/// Only the control loop touches the filters, so the controller itself needs
/// no interior locking.
#[derive(Debug)]
pub struct PlannerController {
    alpha: f64,
    memory: u64,
    period_ms: f64,
    filters: HashMap<String, Filter>,
}

impl PlannerController {
    pub fn new(alpha: f64, memory: u64, control_period: Duration) -> Self {
        Self {
            alpha,
            memory,
            period_ms: control_period.as_secs_f64() * 1000.0,
            filters: HashMap::new(),
        }
    }

    /// Start a filter for a service, seeded with its allocation hint
    pub fn add_service(&mut self, service: &Service) {
        self.filters.insert(
            service.name.clone(),
            Filter {
                service: service.clone(),
                recommendation: service.target_allocation,
            },
        );
    }

    pub fn remove_service(&mut self, name: &str) -> bool {
        self.filters.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Update the allocation hint used in open-loop mode
    pub fn set_target_allocation(&mut self, name: &str, allocation: f64) -> bool {
        match self.filters.get_mut(name) {
            Some(filter) => {
                filter.service.target_allocation = allocation;
                true
            }
            None => false,
        }
    }

    /// Most recent unclamped recommendation for a service
    pub fn last_optimal_allocation(&self, name: &str) -> Option<f64> {
        self.filters.get(name).map(|f| f.recommendation)
    }

    /// Largest pool the node's memory could hold for this service alone
    pub fn max_allocation(&self, service: &Service) -> u32 {
        u32::try_from(self.memory / service.memory.max(1)).unwrap_or(u32::MAX)
    }

    /// Compute the allocations for the period that starts now
    ///
    /// Only services present both in the snapshot and in the controller are
    /// allocated.
    pub fn control(
        &mut self,
        monitoring: &HashMap<String, MonitoringData>,
        control_enabled: bool,
    ) -> BTreeMap<String, Allocation> {
        let mut names: Vec<&String> = monitoring
            .keys()
            .filter(|name| self.filters.contains_key(name.as_str()))
            .collect();
        names.sort();

        let mut infeasible = Vec::new();
        let mut recommendations = Vec::with_capacity(names.len());
        for name in names {
            let data = &monitoring[name];
            let (recommended, failed) = self.recommend(name, data, control_enabled);
            if failed {
                infeasible.push(name.as_str());
            }
            recommendations.push((name.as_str(), recommended));
        }

        let mut candidates: Vec<Candidate<'_>> = recommendations
            .into_iter()
            .map(|(name, recommended)| {
                let service = &self.filters[name].service;
                let max = self.max_allocation(service);
                let wanted = (recommended - 1e-9).ceil().max(0.0);
                let wanted = if wanted >= f64::from(u32::MAX) {
                    u32::MAX
                } else {
                    wanted as u32
                };
                let clamped = wanted.max(MIN_VIABLE_ALLOCATION).min(max);
                Candidate {
                    name,
                    footprint: service.memory,
                    recommended,
                    clamped,
                    applied: clamped,
                }
            })
            .collect();

        self.fit_budget(&mut candidates);

        candidates
            .iter()
            .map(|c| {
                (
                    c.name.to_string(),
                    Allocation {
                        applied: c.applied,
                        recommended: c.recommended,
                        infeasible: infeasible.contains(&c.name),
                    },
                )
            })
            .collect()
    }

    /// Advance the filter of one service, returning the new recommendation
    /// and whether the estimate was infeasible
    fn recommend(&mut self, name: &str, data: &MonitoringData, control_enabled: bool) -> (f64, bool) {
        let alpha = self.alpha;
        let period_ms = self.period_ms;
        let memory = self.memory;
        let Some(filter) = self.filters.get_mut(name) else {
            return (0.0, false);
        };
        let service = &filter.service;

        if !control_enabled {
            filter.recommendation = service.target_allocation;
            return (filter.recommendation, false);
        }

        let service_time_ms = if data.is_empty() {
            service.target_rt_ms * NOMINAL_SERVICE_SHARE
        } else {
            data.service_time_ms
        };
        let estimate = planner::compute_allocation(
            data.requests as f64,
            service.target_rt_ms,
            period_ms,
            service_time_ms,
        );

        let max = (memory / service.memory.max(1)) as f64;
        let (estimate_value, failed) = match estimate.allocation() {
            // Completions are capped by the current pool, so a backlog shows
            // up only in the observed response time.
            Some(value) if data.requests > 0 && data.response_time_ms > service.target_rt_ms => {
                let pressure = data.response_time_ms / service.target_rt_ms;
                ((value * pressure).min(max.max(value)), false)
            }
            Some(value) => (value, false),
            None => {
                let fallback = max;
                warn!(
                    service = %name,
                    requests = data.requests,
                    observed_rt_ms = data.response_time_ms,
                    target_rt_ms = service.target_rt_ms,
                    fallback,
                    "Target response time unreachable, falling back to memory maximum"
                );
                (fallback, true)
            }
        };

        filter.recommendation = alpha * estimate_value + (1.0 - alpha) * filter.recommendation;
        debug!(
            service = %name,
            estimate = estimate_value,
            recommendation = filter.recommendation,
            "Filter updated"
        );
        (filter.recommendation, failed)
    }

    /// Shrink allocations until `sum(applied * footprint) <= memory`
    ///
    /// Every allocation is scaled by the same factor first; if minimum pools
    /// still overflow the budget, services are cut starting from the smallest
    /// recommendation (least pressure), ties broken by name. Memory freed by
    /// rounding is handed back starting from the largest recommendation.
    fn fit_budget(&self, candidates: &mut [Candidate<'_>]) {
        let demand: u64 = candidates
            .iter()
            .map(|c| u64::from(c.clamped) * c.footprint)
            .sum();
        if demand <= self.memory {
            return;
        }

        let scale = self.memory as f64 / demand as f64;
        for c in candidates.iter_mut() {
            let scaled = (f64::from(c.clamped) * scale).floor() as u32;
            c.applied = scaled.max(MIN_VIABLE_ALLOCATION).min(c.clamped);
        }

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| {
            candidates[a]
                .recommended
                .total_cmp(&candidates[b].recommended)
                .then_with(|| candidates[a].name.cmp(candidates[b].name))
        });

        let mut used: u64 = candidates
            .iter()
            .map(|c| u64::from(c.applied) * c.footprint)
            .sum();

        for &i in &order {
            if used <= self.memory {
                break;
            }
            let c = &mut candidates[i];
            let excess = used - self.memory;
            let cut = excess.div_ceil(c.footprint).min(u64::from(c.applied));
            c.applied -= cut as u32;
            used -= cut * c.footprint;
            debug!(service = %c.name, cut, "Under-allocating to fit memory budget");
        }

        for &i in order.iter().rev() {
            let c = &mut candidates[i];
            while c.applied < c.clamped && used + c.footprint <= self.memory {
                c.applied += 1;
                used += c.footprint;
            }
        }
    }
}
