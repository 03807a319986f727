//! Phased request generator

use node_lib::{planner::NOMINAL_SERVICE_SHARE, ExecuteOutcome, NodeFacade, Service, ServiceRequest};
use serde::Serialize;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait between two submissions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gap {
    /// Always the same interval, in milliseconds
    Fixed(f64),
    /// A fresh processing-time sample scaled by this factor
    Scaled(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub name: &'static str,
    pub requests: u64,
    pub gap: Gap,
}

/// Steady warm-up, then rising, peak and falling arrival rates
pub fn plan(service: &Service, steady: u64, requests: u64) -> Vec<Phase> {
    let third = requests / 3;
    vec![
        Phase {
            name: "steady",
            requests: steady,
            gap: Gap::Fixed(service.target_rt_ms),
        },
        Phase {
            name: "ramp-up",
            requests: third,
            gap: Gap::Scaled(0.8),
        },
        Phase {
            name: "peak",
            requests: third,
            gap: Gap::Scaled(0.3),
        },
        Phase {
            name: "ramp-down",
            requests: third,
            gap: Gap::Scaled(0.7),
        },
    ]
}

/// Processing time distribution of a service: normal around the nominal
/// share of its target, with a 10% standard deviation
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub mean_ms: f64,
    pub std_dev_ms: f64,
}

impl CostModel {
    pub fn for_service(service: &Service) -> Self {
        let mean_ms = service.target_rt_ms * NOMINAL_SERVICE_SHARE;
        Self {
            mean_ms,
            std_dev_ms: mean_ms * 0.1,
        }
    }

    /// Draw one sample in milliseconds, never negative
    pub fn sample_ms(&self) -> f64 {
        // Box-Muller
        let u1 = 1.0 - rand::random::<f64>();
        let u2 = rand::random::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        (self.mean_ms + self.std_dev_ms * z).max(0.0)
    }

    pub fn sample(&self) -> Duration {
        Duration::from_millis(self.sample_ms() as u64)
    }
}

/// Submission counts of one generator
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub service: String,
    pub accepted: u64,
    pub rejected: u64,
}

/// Drive one service through `phases`, reporting each phase start
pub async fn drive(
    node: Arc<NodeFacade>,
    service: Service,
    phases: Vec<Phase>,
    on_phase: impl Fn(&Service, &Phase),
) -> LoadStats {
    let costs = CostModel::for_service(&service);
    let mut stats = LoadStats {
        service: service.name.clone(),
        ..LoadStats::default()
    };

    for phase in &phases {
        on_phase(&service, phase);
        for _ in 0..phase.requests {
            match node.execute(ServiceRequest::new(&service, costs.sample())) {
                ExecuteOutcome::Accepted => stats.accepted += 1,
                _ => stats.rejected += 1,
            }
            let gap_ms = match phase.gap {
                Gap::Fixed(ms) => ms,
                Gap::Scaled(factor) => costs.sample_ms() * factor,
            };
            tokio::time::sleep(Duration::from_millis(gap_ms as u64)).await;
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_lib::NodeSettings;

    #[test]
    fn test_plan_splits_requests_in_thirds() {
        let service = Service::new("a", 128, 120.0);
        let phases = plan(&service, 200, 1000);

        let counts: Vec<u64> = phases.iter().map(|p| p.requests).collect();
        assert_eq!(counts, vec![200, 333, 333, 333]);
        assert_eq!(phases[0].gap, Gap::Fixed(120.0));
        assert_eq!(phases[2].gap, Gap::Scaled(0.3));
    }

    #[test]
    fn test_cost_samples_center_on_nominal_share() {
        let costs = CostModel::for_service(&Service::new("a", 128, 100.0));
        let n = 20_000;
        let mean = (0..n).map(|_| costs.sample_ms()).sum::<f64>() / n as f64;

        assert!((mean - 80.0).abs() < 1.0, "mean was {mean}");
        assert!((0..1000).all(|_| costs.sample_ms() >= 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_submits_every_request() {
        let node = Arc::new(
            NodeFacade::new(NodeSettings::new(
                "sim",
                1024,
                Duration::from_millis(1000),
                0.9,
                true,
            ))
            .unwrap(),
        );
        node.set_verbose(false);
        let service = Service::new("a", 128, 20.0).with_target_allocation(2.0);
        node.add_service(service.clone()).await.unwrap();

        let phases = plan(&service, 5, 9);
        let started = std::sync::Mutex::new(Vec::new());
        let stats = drive(node.clone(), service, phases, |_, phase| {
            started.lock().unwrap().push(phase.name)
        })
        .await;

        assert_eq!(stats.accepted, 14);
        assert_eq!(stats.rejected, 0);
        assert_eq!(
            *started.lock().unwrap(),
            vec!["steady", "ramp-up", "peak", "ramp-down"]
        );
        node.stop().await;
    }
}
