//! Static allocation estimate
//!
//! Sizes a worker pool with an M/M/c (Erlang C) queueing model: the pool is
//! the smallest number of workers whose expected response time, queueing
//! included, stays within the target.

use serde::Serialize;

/// Share of the target response time a request is assumed to spend in
/// service when no processing time has been measured
pub const NOMINAL_SERVICE_SHARE: f64 = 0.8;

/// Largest pool the estimator will recommend
pub const MAX_WORKERS: u32 = 4096;

/// Outcome of an allocation estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "workers", rename_all = "lowercase")]
pub enum Estimate {
    /// No load; nothing needs to run
    Idle,
    /// Smallest stable pool meeting the target
    Workers(u32),
    /// No pool up to `MAX_WORKERS` meets the target
    Infeasible,
}

impl Estimate {
    /// Allocation as a number of workers, `None` when infeasible
    pub fn allocation(&self) -> Option<f64> {
        match self {
            Estimate::Idle => Some(0.0),
            Estimate::Workers(c) => Some(f64::from(*c)),
            Estimate::Infeasible => None,
        }
    }

    pub fn is_infeasible(&self) -> bool {
        matches!(self, Estimate::Infeasible)
    }
}

/// Estimate the pool size for `requests` arrivals per `period_ms`, each
/// taking `service_time_ms` to process, so that the mean response time is at
/// most `target_rt_ms`
pub fn compute_allocation(
    requests: f64,
    target_rt_ms: f64,
    period_ms: f64,
    service_time_ms: f64,
) -> Estimate {
    if requests.is_nan() || requests <= 0.0 || period_ms <= 0.0 {
        return Estimate::Idle;
    }
    if service_time_ms <= 0.0 {
        return Estimate::Workers(1);
    }
    // Response time can never drop below the service time itself
    if service_time_ms >= target_rt_ms {
        return Estimate::Infeasible;
    }

    let arrival_rate = requests / period_ms;
    let offered_load = arrival_rate * service_time_ms;

    // Stability needs utilization < 1, i.e. more workers than offered load
    let first = offered_load.floor() + 1.0;
    if first > f64::from(MAX_WORKERS) {
        return Estimate::Infeasible;
    }
    let first = first as u32;

    // Erlang B by recurrence up to the first stable pool size
    let mut blocking = 1.0;
    for c in 1..first {
        blocking = erlang_b_step(blocking, offered_load, c);
    }

    for c in first..=MAX_WORKERS {
        blocking = erlang_b_step(blocking, offered_load, c);
        let rt = response_time(blocking, offered_load, c, service_time_ms);
        if rt <= target_rt_ms {
            return Estimate::Workers(c);
        }
    }

    Estimate::Infeasible
}

/// Estimate from a request count alone, assuming the nominal service time
pub fn compute_static_allocation(requests: f64, target_rt_ms: f64, period_ms: f64) -> Estimate {
    compute_allocation(
        requests,
        target_rt_ms,
        period_ms,
        target_rt_ms * NOMINAL_SERVICE_SHARE,
    )
}

fn erlang_b_step(previous: f64, offered_load: f64, servers: u32) -> f64 {
    let x = offered_load * previous;
    x / (f64::from(servers) + x)
}

/// Mean response time of an M/M/c queue given its Erlang B blocking
/// probability
fn response_time(blocking: f64, offered_load: f64, servers: u32, service_time_ms: f64) -> f64 {
    let servers = f64::from(servers);
    let utilization = offered_load / servers;
    let wait_probability = blocking / (1.0 - utilization * (1.0 - blocking));
    service_time_ms + wait_probability * service_time_ms / (servers - offered_load)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_load_is_idle() {
        assert_eq!(compute_static_allocation(0.0, 120.0, 9000.0), Estimate::Idle);
        assert_eq!(Estimate::Idle.allocation(), Some(0.0));
    }

    #[test]
    fn test_light_load_needs_one_worker() {
        assert_eq!(
            compute_static_allocation(1.0, 120.0, 9000.0),
            Estimate::Workers(1)
        );
    }

    #[test]
    fn test_queueing_delay_forces_extra_worker() {
        // 90 requests per 9s at 96ms each: two workers are stable but the
        // queueing delay pushes the mean response time past 120ms
        assert_eq!(
            compute_static_allocation(90.0, 120.0, 9000.0),
            Estimate::Workers(3)
        );
    }

    #[test]
    fn test_pool_is_always_stable() {
        for requests in [10.0, 500.0, 5_000.0, 50_000.0] {
            if let Estimate::Workers(c) = compute_static_allocation(requests, 100.0, 9000.0) {
                let offered = requests / 9000.0 * 80.0;
                assert!(f64::from(c) > offered, "utilization must stay below 1");
            } else {
                panic!("expected a finite pool for {requests} requests");
            }
        }
    }

    #[test]
    fn test_allocation_grows_with_load() {
        let mut last = 0;
        for requests in [100.0, 1_000.0, 10_000.0] {
            match compute_static_allocation(requests, 120.0, 9000.0) {
                Estimate::Workers(c) => {
                    assert!(c >= last);
                    last = c;
                }
                other => panic!("unexpected estimate {other:?}"),
            }
        }
    }

    #[test]
    fn test_service_time_above_target_is_infeasible() {
        let estimate = compute_allocation(10.0, 100.0, 9000.0, 150.0);
        assert!(estimate.is_infeasible());
        assert_eq!(estimate.allocation(), None);
    }

    #[test]
    fn test_overload_beyond_max_workers_is_infeasible() {
        assert_eq!(
            compute_static_allocation(900_000.0, 120.0, 9000.0),
            Estimate::Infeasible
        );
    }

    #[test]
    fn test_zero_service_time_needs_one_worker() {
        assert_eq!(
            compute_allocation(100.0, 120.0, 9000.0, 0.0),
            Estimate::Workers(1)
        );
    }
}
