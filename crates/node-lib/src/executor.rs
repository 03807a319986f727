//! Per-service worker pool
//!
//! Requests go into an unbounded queue shared by the service's workers. The
//! control loop resizes the pool: new workers start pulling work at once,
//! retired workers finish the unit they hold before exiting.

use crate::controller::MIN_VIABLE_ALLOCATION;
use crate::models::{Service, ServiceRequest};
use crate::monitor::Monitor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of submitting a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteOutcome {
    /// Queued for execution
    Accepted,
    /// No such service on this node; the request was dropped
    UnknownService,
    /// The service stopped accepting work or its queue is full
    Rejected,
}

/// Executor tuning
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Bound on queued-but-unstarted requests; `None` queues without limit
    pub max_pending: Option<usize>,
}

struct QueuedRequest {
    request: ServiceRequest,
    enqueued_at: Instant,
}

struct Worker {
    retire: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// State shared between the executor and its worker tasks
struct Shared {
    service: String,
    monitor: Arc<Monitor>,
    queue: Mutex<mpsc::UnboundedReceiver<QueuedRequest>>,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Shared {
    async fn next_request(&self) -> Option<QueuedRequest> {
        let next = self.queue.lock().await.recv().await;
        if next.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        next
    }

    async fn process(&self, queued: QueuedRequest) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        tokio::time::sleep(queued.request.cost).await;
        let finished = Instant::now();

        self.monitor.record_completion(
            &self.service,
            finished - queued.enqueued_at,
            finished - started,
        );
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_worker(shared: Arc<Shared>, mut retire: oneshot::Receiver<()>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut retire => break,
            next = shared.next_request() => next,
        };
        match next {
            Some(queued) => shared.process(queued).await,
            None => break,
        }
    }
}

#[derive(Default)]
struct Pool {
    active: Vec<Worker>,
    /// Retired workers that may still be finishing a unit
    draining: Vec<JoinHandle<()>>,
}

/// Executes the requests of one service on a resizable pool
pub struct ServiceExecutor {
    service: Service,
    node_memory: u64,
    options: ExecutorOptions,
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<QueuedRequest>,
    pool: Mutex<Pool>,
    size: AtomicUsize,
    accepting: AtomicBool,
    last_epoch: AtomicU64,
}

impl ServiceExecutor {
    pub fn new(service: Service, node_memory: u64, monitor: Arc<Monitor>) -> Self {
        Self::with_options(service, node_memory, monitor, ExecutorOptions::default())
    }

    pub fn with_options(
        service: Service,
        node_memory: u64,
        monitor: Arc<Monitor>,
        options: ExecutorOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            service: service.name.clone(),
            monitor,
            queue: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        });

        Self {
            service,
            node_memory,
            options,
            shared,
            sender,
            pool: Mutex::new(Pool::default()),
            size: AtomicUsize::new(0),
            accepting: AtomicBool::new(false),
            last_epoch: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Size the pool from the allocation hint and begin accepting work
    pub async fn start(&self) {
        let max = self.node_memory / self.service.memory.max(1);
        let hinted = self.service.target_allocation.ceil().max(0.0) as u64;
        let initial = hinted.max(u64::from(MIN_VIABLE_ALLOCATION)).min(max) as usize;

        self.set_size(initial).await;
        self.accepting.store(true, Ordering::SeqCst);
        info!(service = %self.service, workers = initial, "Service executor started");
    }

    /// Queue a request; never waits for a worker
    pub fn execute(&self, request: ServiceRequest) -> ExecuteOutcome {
        if !self.accepting.load(Ordering::SeqCst) {
            return ExecuteOutcome::Rejected;
        }
        if let Some(max) = self.options.max_pending {
            if self.pending() >= max {
                return ExecuteOutcome::Rejected;
            }
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedRequest {
            request,
            enqueued_at: Instant::now(),
        };
        match self.sender.send(queued) {
            Ok(()) => ExecuteOutcome::Accepted,
            Err(_) => {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                ExecuteOutcome::Rejected
            }
        }
    }

    /// Apply the allocation of control tick `epoch`
    ///
    /// Returns false, leaving the pool untouched, when an allocation of the
    /// same or a later tick was already applied.
    pub async fn apply(&self, epoch: u64, workers: u32) -> bool {
        let previous = self.last_epoch.fetch_max(epoch, Ordering::SeqCst);
        if previous >= epoch {
            debug!(service = %self.service, epoch, previous, "Ignoring stale allocation");
            return false;
        }
        self.set_size(workers as usize).await;
        true
    }

    /// Resize the pool to exactly `n` workers
    pub async fn set_size(&self, n: usize) {
        let mut pool = self.pool.lock().await;
        pool.draining.retain(|handle| !handle.is_finished());

        let current = pool.active.len();
        if n > current {
            for _ in current..n {
                let (retire, retire_rx) = oneshot::channel();
                let handle = tokio::spawn(run_worker(self.shared.clone(), retire_rx));
                pool.active.push(Worker { retire, handle });
            }
        } else if n < current {
            let retired: Vec<Worker> = pool.active.drain(n..).collect();
            for worker in retired {
                let _ = worker.retire.send(());
                pool.draining.push(worker.handle);
            }
        }

        self.size.store(n, Ordering::SeqCst);
        if n != current {
            debug!(service = %self.service, from = current, to = n, "Pool resized");
        }
    }

    /// Stop accepting work, abort every worker and drop queued requests
    ///
    /// Returns the number of queued requests that were abandoned.
    pub async fn shutdown_now(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        let workers = {
            let mut pool = self.pool.lock().await;
            let mut handles: Vec<JoinHandle<()>> =
                pool.active.drain(..).map(|w| w.handle).collect();
            handles.append(&mut pool.draining);
            handles
        };
        for handle in &workers {
            handle.abort();
        }
        for handle in workers {
            let _ = handle.await;
        }
        self.size.store(0, Ordering::SeqCst);

        let mut abandoned = 0;
        let mut queue = self.shared.queue.lock().await;
        queue.close();
        while queue.try_recv().is_ok() {
            abandoned += 1;
        }
        self.shared.pending.store(0, Ordering::SeqCst);
        self.shared.in_flight.store(0, Ordering::SeqCst);

        info!(service = %self.service, abandoned, "Service executor shut down");
        abandoned
    }

    /// Workers currently in the pool, excluding retirees still draining
    pub fn pool_size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Requests queued but not yet started
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Requests currently being processed
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn executor(hint: f64, monitor: Arc<Monitor>) -> ServiceExecutor {
        let service = Service::new("svc", 128, 120.0).with_target_allocation(hint);
        monitor.add_service("svc");
        ServiceExecutor::new(service, 8192, monitor)
    }

    fn request(ms: u64) -> ServiceRequest {
        ServiceRequest::for_service("svc", Duration::from_millis(ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sizes_pool_from_hint() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(4.2, monitor);

        assert_eq!(exec.execute(request(1)), ExecuteOutcome::Rejected);
        exec.start().await;
        assert_eq!(exec.pool_size(), 5);
        assert!(exec.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_respects_node_memory() {
        let monitor = Arc::new(Monitor::new());
        let service = Service::new("svc", 4096, 120.0).with_target_allocation(10.0);
        let exec = ServiceExecutor::new(service, 8192, monitor);

        exec.start().await;
        assert_eq!(exec.pool_size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_complete_and_report() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(2.0, monitor.clone());
        exec.start().await;

        for _ in 0..4 {
            assert_eq!(exec.execute(request(100)), ExecuteOutcome::Accepted);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let data = monitor.read();
        assert_eq!(data["svc"].requests, 4);
        // Two waves of two: the second wave queued for 100ms
        assert!((data["svc"].response_time_ms - 150.0).abs() < 1.0);
        assert!((data["svc"].service_time_ms - 100.0).abs() < 1.0);
        assert_eq!(exec.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_queues_instead_of_rejecting() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(1.0, monitor.clone());
        exec.start().await;

        for _ in 0..1_000 {
            assert_eq!(exec.execute(request(50)), ExecuteOutcome::Accepted);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // One unit in flight, the backlog grows without bound
        assert_eq!(exec.in_flight(), 1);
        assert_eq!(exec.pending(), 999);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_queue_rejects_overflow() {
        let monitor = Arc::new(Monitor::new());
        monitor.add_service("svc");
        let service = Service::new("svc", 128, 120.0).with_target_allocation(1.0);
        let exec = ServiceExecutor::with_options(
            service,
            8192,
            monitor,
            ExecutorOptions {
                max_pending: Some(2),
            },
        );
        exec.start().await;

        assert_eq!(exec.execute(request(50)), ExecuteOutcome::Accepted);
        assert_eq!(exec.execute(request(50)), ExecuteOutcome::Accepted);
        assert_eq!(exec.execute(request(50)), ExecuteOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_lets_in_flight_units_finish() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(5.0, monitor.clone());
        exec.start().await;

        for _ in 0..5 {
            exec.execute(request(1_000));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exec.in_flight(), 5);

        exec.set_size(2).await;
        assert_eq!(exec.pool_size(), 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(monitor.read()["svc"].requests, 5);
        assert_eq!(exec.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_keeps_queued_work() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(4.0, monitor.clone());
        exec.start().await;

        for _ in 0..10 {
            exec.execute(request(100));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        exec.set_size(1).await;

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(monitor.read()["svc"].requests, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grow_picks_up_backlog() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(1.0, monitor.clone());
        exec.start().await;

        for _ in 0..4 {
            exec.execute(request(100));
        }
        exec.set_size(4).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(monitor.read()["svc"].requests, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_is_ignored() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(1.0, monitor);
        exec.start().await;

        assert!(exec.apply(2, 3).await);
        assert_eq!(exec.pool_size(), 3);
        assert!(!exec.apply(2, 6).await);
        assert!(!exec.apply(1, 6).await);
        assert_eq!(exec.pool_size(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_queue() {
        let monitor = Arc::new(Monitor::new());
        let exec = executor(1.0, monitor.clone());
        exec.start().await;

        for _ in 0..5 {
            exec.execute(request(1_000));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let abandoned = exec.shutdown_now().await;
        assert_eq!(abandoned, 4);
        assert_eq!(exec.pool_size(), 0);
        assert_eq!(exec.execute(request(1)), ExecuteOutcome::Rejected);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(monitor.read()["svc"].requests, 0);
    }
}
