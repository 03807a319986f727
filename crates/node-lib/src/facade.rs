//! Node controller
//!
//! Hosts the services of one node and runs the periodic control tick:
//! snapshot monitoring, compute allocations, resize the pools, record
//! history, hand the allocation log to the dispatcher, notify observers.

use crate::controller::{Allocation, PlannerController};
use crate::error::{NodeError, Result};
use crate::executor::{ExecuteOutcome, ServiceExecutor};
use crate::health::{components, HealthRegistry};
use crate::history::History;
use crate::models::{AllocationRecord, HistoryData, MonitoringData, Service, ServiceRequest};
use crate::monitor::Monitor;
use crate::observability::{NodeLogger, NodeMetrics, ServiceSample};
use crate::planner;
use crate::settings::NodeSettings;
use crate::sink::{CsvFileSink, LogDispatcher, RecordSink, SinkList};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What one control tick decided
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub epoch: u64,
    pub timestamp_ms: i64,
    pub monitoring: HashMap<String, MonitoringData>,
    pub allocations: BTreeMap<String, Allocation>,
    /// Services that got no allocation this tick
    pub skipped: Vec<String>,
}

/// Receives a summary after every control tick
///
/// Observers run on the control loop and must return quickly; a panicking
/// observer is logged and ignored.
pub trait TickObserver: Send + Sync {
    fn after_tick(&self, summary: &TickSummary);
}

impl<F> TickObserver for F
where
    F: Fn(&TickSummary) + Send + Sync,
{
    fn after_tick(&self, summary: &TickSummary) {
        self(summary)
    }
}

/// Best-effort counters taken after each tick; -1 before the first tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub ticks: u64,
    /// Workers across all pools
    pub last_threads: i64,
    /// Sum of applied allocations
    pub last_allocation: i64,
}

/// Read-only view of a hosted service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub memory: u64,
    pub target_rt_ms: f64,
    pub pool_size: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub last_optimal_allocation: Option<f64>,
}

struct Inner {
    settings: NodeSettings,
    executors: DashMap<String, Arc<ServiceExecutor>>,
    /// Serializes registry changes against the compute/apply phase of a tick
    controller: Mutex<PlannerController>,
    monitor: Arc<Monitor>,
    history: History,
    sinks: SinkList,
    dispatcher: Mutex<Option<LogDispatcher>>,
    observers: RwLock<Vec<Arc<dyn TickObserver>>>,
    verbose: AtomicBool,
    epoch: AtomicU64,
    last_threads: AtomicI64,
    last_allocation: AtomicI64,
    metrics: NodeMetrics,
    logger: NodeLogger,
    health: HealthRegistry,
}

impl Inner {
    async fn tick(&self) -> TickSummary {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut skipped = Vec::new();
        let mut total_allocation: i64 = 0;

        let (epoch, timestamp_ms, monitoring, allocations) = {
            let mut controller = self.controller.lock().await;
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let monitoring = self.monitor.read();
            let allocations =
                controller.control(&monitoring, self.settings.control_enabled);
            let timestamp_ms = chrono::Utc::now().timestamp_millis();

            for (name, allocation) in &allocations {
                let Some(executor) = self.executors.get(name).map(|e| e.value().clone()) else {
                    self.logger.log_skipped_service(epoch, name, "no executor");
                    skipped.push(name.clone());
                    continue;
                };
                let data = monitoring.get(name).copied().unwrap_or_default();

                executor.apply(epoch, allocation.applied).await;
                total_allocation += i64::from(allocation.applied);

                self.history.add_data(
                    name,
                    HistoryData {
                        epoch,
                        timestamp_ms,
                        monitoring: data,
                        allocation: allocation.applied,
                        optimal_allocation: allocation.recommended,
                        infeasible: allocation.infeasible,
                    },
                );

                let service = executor.service();
                if allocation.infeasible {
                    self.logger
                        .log_shortfall(name, data.response_time_ms, service.target_rt_ms);
                }
                self.metrics.record_service(
                    name,
                    &ServiceSample {
                        applied: allocation.applied,
                        recommended: allocation.recommended,
                        response_time_ms: data.response_time_ms,
                        completed: data.requests,
                        pending: executor.pending(),
                        infeasible: allocation.infeasible,
                    },
                );
                records.push(AllocationRecord {
                    node_id: self.settings.node_id.clone(),
                    timestamp_ms,
                    service_id: name.clone(),
                    target_rt_ms: service.target_rt_ms,
                    observed_rt_ms: data.response_time_ms,
                    requests: data.requests,
                    allocation: allocation.applied,
                });
            }

            for name in monitoring.keys() {
                if !allocations.contains_key(name) {
                    self.logger.log_skipped_service(epoch, name, "no controller state");
                    skipped.push(name.clone());
                }
            }

            (epoch, timestamp_ms, monitoring, allocations)
        };

        if self.verbose.load(Ordering::SeqCst) && !records.is_empty() {
            let mut dispatcher = self.dispatcher.lock().await;
            dispatcher
                .get_or_insert_with(|| {
                    LogDispatcher::spawn(
                        self.sinks.clone(),
                        self.metrics.clone(),
                        self.health.clone(),
                    )
                })
                .dispatch(records);
        }

        let summary = TickSummary {
            epoch,
            timestamp_ms,
            monitoring,
            allocations,
            skipped,
        };

        let observers = self.observers.read().await.clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer.after_tick(&summary))).is_err() {
                self.logger.log_observer_panic(epoch);
            }
        }

        let threads: usize = self.executors.iter().map(|e| e.value().pool_size()).sum();
        self.last_threads
            .store(i64::try_from(threads).unwrap_or(i64::MAX), Ordering::SeqCst);
        self.last_allocation.store(total_allocation, Ordering::SeqCst);

        self.metrics
            .observe_tick(started.elapsed().as_secs_f64(), total_allocation);
        self.health.record_tick(summary.skipped.len()).await;
        debug!(
            epoch,
            services = summary.allocations.len(),
            total_allocation,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Control tick complete"
        );

        summary
    }
}

async fn run_control_loop(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let period = inner.settings.control_period;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Run each tick in its own task so a panic cannot end the loop
                let tick_inner = inner.clone();
                if let Err(e) = tokio::spawn(async move { tick_inner.tick().await }).await {
                    warn!(error = %e, "Control tick failed, retrying next period");
                    inner
                        .health
                        .set_degraded(components::CONTROL_LOOP, "last control tick failed")
                        .await;
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down control loop");
                break;
            }
        }
    }
}

/// Elastic resource controller of a single node
pub struct NodeFacade {
    inner: Arc<Inner>,
    control_task: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

impl NodeFacade {
    /// Build a node; rejects invalid settings
    pub fn new(settings: NodeSettings) -> Result<Self> {
        settings.validate()?;

        let inner = Inner {
            controller: Mutex::new(PlannerController::new(
                settings.alpha,
                settings.memory,
                settings.control_period,
            )),
            executors: DashMap::new(),
            monitor: Arc::new(Monitor::new()),
            history: History::new(settings.history_capacity),
            sinks: Arc::new(RwLock::new(Vec::new())),
            dispatcher: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            verbose: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            last_threads: AtomicI64::new(-1),
            last_allocation: AtomicI64::new(-1),
            metrics: NodeMetrics::new(),
            logger: NodeLogger::new(settings.node_id.clone()),
            health: HealthRegistry::new(),
            settings,
        };

        Ok(Self {
            inner: Arc::new(inner),
            control_task: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.settings.node_id
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.inner.settings
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    /// Start the periodic control loop; the first tick fires one control
    /// period from now
    pub async fn start(&self) -> Result<()> {
        let mut task = self.control_task.lock().await;
        if task.is_some() {
            return Err(NodeError::AlreadyStarted);
        }

        self.inner.health.register(components::CONTROL_LOOP).await;
        self.inner.health.register(components::LOG_SINK).await;

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_control_loop(self.inner.clone(), rx));
        *task = Some((tx, handle));

        self.inner.health.set_ready(true).await;
        let settings = &self.inner.settings;
        self.inner.logger.log_startup(
            settings.memory,
            settings.control_period.as_millis(),
            settings.alpha,
            settings.control_enabled,
        );
        Ok(())
    }

    /// Stop the timer, remove every service, then stop the log worker
    pub async fn stop(&self) {
        if let Some((tx, handle)) = self.control_task.lock().await.take() {
            let _ = tx.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "Control loop ended abnormally");
            }
        }

        let names: Vec<String> = self
            .inner
            .executors
            .iter()
            .map(|e| e.key().clone())
            .collect();
        let services = names.len();
        for name in names {
            self.remove_service(&name).await;
        }

        if let Some(dispatcher) = self.inner.dispatcher.lock().await.take() {
            dispatcher.shutdown().await;
        }

        self.inner.health.set_ready(false).await;
        self.inner.logger.log_shutdown(services);
    }

    /// Run one control tick immediately
    ///
    /// Ticks never overlap: a manual tick waits for a running periodic one.
    pub async fn tick(&self) -> TickSummary {
        self.inner.tick().await
    }

    /// Register a service and start its pool
    pub async fn add_service(&self, service: Service) -> Result<()> {
        service.validate()?;

        let inner = &self.inner;
        let mut controller = inner.controller.lock().await;
        if inner.executors.contains_key(&service.name) {
            return Err(NodeError::DuplicateService(service.name));
        }

        let executor = Arc::new(ServiceExecutor::with_options(
            service.clone(),
            inner.settings.memory,
            inner.monitor.clone(),
            inner.settings.executor.clone(),
        ));
        controller.add_service(&service);
        inner.monitor.add_service(&service.name);
        inner.history.add_service(&service.name);
        executor.start().await;
        inner.executors.insert(service.name.clone(), executor);

        inner.metrics.set_services(inner.executors.len());
        inner.logger.log_service_added(
            &service.name,
            service.memory,
            service.target_rt_ms,
            service.target_allocation,
        );
        Ok(())
    }

    /// Remove a service, cancelling its queued and in-flight work
    ///
    /// Returns false when the service was not registered.
    pub async fn remove_service(&self, name: &str) -> bool {
        let inner = &self.inner;
        let mut controller = inner.controller.lock().await;
        let Some((_, executor)) = inner.executors.remove(name) else {
            debug!(service = %name, "Remove ignored for unknown service");
            return false;
        };

        let abandoned = executor.shutdown_now().await;
        controller.remove_service(name);
        inner.monitor.remove_service(name);
        inner.history.remove_service(name);

        inner.metrics.forget_service(name);
        inner.metrics.set_services(inner.executors.len());
        inner.logger.log_service_removed(name, abandoned);
        true
    }

    /// Change the allocation hint of a service
    ///
    /// Returns false for unknown services and for hints that are negative or
    /// not finite.
    pub async fn set_target_allocation(&self, name: &str, allocation: f64) -> bool {
        if !(allocation.is_finite() && allocation >= 0.0) {
            warn!(service = %name, allocation, "Rejected invalid target allocation");
            return false;
        }
        self.inner
            .controller
            .lock()
            .await
            .set_target_allocation(name, allocation)
    }

    /// Submit a request; never blocks the caller
    pub fn execute(&self, request: ServiceRequest) -> ExecuteOutcome {
        let executor = self
            .inner
            .executors
            .get(&request.service)
            .map(|e| e.value().clone());
        match executor {
            Some(executor) => executor.execute(request),
            None => {
                debug!(service = %request.service, "Request for unknown service dropped");
                ExecuteOutcome::UnknownService
            }
        }
    }

    /// History recorded since the last call for this service
    pub fn get_history(&self, name: &str) -> Vec<HistoryData> {
        self.inner.history.read(name)
    }

    /// Unclamped recommendation of the last tick
    pub async fn get_last_optimal_allocation(&self, name: &str) -> Option<f64> {
        self.inner
            .controller
            .lock()
            .await
            .last_optimal_allocation(name)
    }

    pub fn is_serving(&self, name: &str) -> bool {
        self.inner.executors.contains_key(name)
    }

    /// Static pool size for requests arriving every `inter_arrival_ms`
    ///
    /// Returns infinity when no pool meets the target.
    pub fn get_static_allocation(
        inter_arrival_ms: f64,
        target_rt_ms: f64,
        control_period_ms: f64,
    ) -> f64 {
        let requests = control_period_ms / inter_arrival_ms;
        planner::compute_static_allocation(requests, target_rt_ms, control_period_ms)
            .allocation()
            .unwrap_or(f64::INFINITY)
    }

    /// Register an observer called after every tick
    pub async fn add_tick_observer(&self, observer: impl TickObserver + 'static) {
        self.inner.observers.write().await.push(Arc::new(observer));
    }

    /// Register a destination for the allocation log
    pub async fn add_sink(&self, sink: Arc<dyn RecordSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    /// Also write the allocation log to a CSV file at `path`
    pub async fn log_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let sink = CsvFileSink::create(path).await?;
        self.add_sink(Arc::new(sink)).await;
        Ok(())
    }

    /// Enable or disable the allocation log
    pub fn set_verbose(&self, verbose: bool) {
        self.inner.verbose.store(verbose, Ordering::SeqCst);
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            ticks: self.inner.epoch.load(Ordering::SeqCst),
            last_threads: self.inner.last_threads.load(Ordering::SeqCst),
            last_allocation: self.inner.last_allocation.load(Ordering::SeqCst),
        }
    }

    /// Snapshot of every hosted service, sorted by name
    pub async fn service_statuses(&self) -> Vec<ServiceStatus> {
        let controller = self.inner.controller.lock().await;
        let mut statuses: Vec<ServiceStatus> = self
            .inner
            .executors
            .iter()
            .map(|entry| {
                let executor = entry.value();
                let service = executor.service();
                ServiceStatus {
                    name: service.name.clone(),
                    memory: service.memory,
                    target_rt_ms: service.target_rt_ms,
                    pool_size: executor.pool_size(),
                    pending: executor.pending(),
                    in_flight: executor.in_flight(),
                    last_optimal_allocation: controller.last_optimal_allocation(&service.name),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

impl Drop for NodeFacade {
    fn drop(&mut self) {
        // A node dropped without stop() must not leave its timer running
        if let Ok(mut task) = self.control_task.try_lock() {
            if let Some((_, handle)) = task.take() {
                handle.abort();
            }
        }
    }
}
