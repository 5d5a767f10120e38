use std::{sync::Arc, time::Duration};

use metrics::{Counter, Gauge, Histogram};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::recommit::interval::RecommitInterval;
use crate::{
    assembler::{BlockAssembler, BuildError, BuildSummary, GenerateParams, OrderWithArrival},
    execution::ExecutionAdapter,
};

pub mod interval;

/// Where the controller is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControllerState {
    #[default]
    Idle,
    Assembling,
    WaitingInterval,
}

/// Snapshot of the controller, published after every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecommitStatus {
    pub state: ControllerState,
    pub min_interval: Duration,
    pub recommit_interval: Duration,
    /// Attempts that sealed a block.
    pub completed: u64,
    /// Attempts that ended with an error other than an interrupt.
    pub failed: u64,
    /// Attempts interrupted by a recommit tick.
    pub interrupted: u64,
    pub last_duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecommitEvent {
    /// A new chain head arrived, supersedes any running attempt.
    NewHead,
    /// New orders arrived, picked up on the next tick.
    NewTransactions,
    /// Start a fresh attempt now.
    Recommit,
    Increase(f64),
    Decrease,
    SetInterval(Duration),
    Shutdown,
}

/// One block building attempt.
pub trait BuildTask: Send + Sync + 'static {
    /// Runs on a blocking thread. Implementations should stop with
    /// [`BuildError::Cancelled`] soon after `cancel` fires.
    fn build(&self, cancel: CancellationToken) -> Result<BuildSummary, BuildError>;
}

impl<F> BuildTask for F
where
    F: Fn(CancellationToken) -> Result<BuildSummary, BuildError> + Send + Sync + 'static,
{
    fn build(&self, cancel: CancellationToken) -> Result<BuildSummary, BuildError> {
        self(cancel)
    }
}

/// Supplies the inputs of each attempt.
pub trait OrderSource: Send + Sync + 'static {
    fn params(&self) -> GenerateParams;

    fn orders(&self) -> Vec<OrderWithArrival>;
}

/// Runs the [`BlockAssembler`] on whatever `source` currently offers.
#[derive(Debug)]
pub struct AssemblyTask<A, S> {
    assembler: Arc<BlockAssembler<A>>,
    source: S,
}

impl<A, S> AssemblyTask<A, S> {
    pub fn new(assembler: Arc<BlockAssembler<A>>, source: S) -> Self {
        Self { assembler, source }
    }
}

impl<A: ExecutionAdapter, S: OrderSource> BuildTask for AssemblyTask<A, S> {
    fn build(&self, cancel: CancellationToken) -> Result<BuildSummary, BuildError> {
        let params = self.source.params();
        let orders = self.source.orders();
        self.assembler.assemble(&params, &orders, &cancel).map(|block| block.summary())
    }
}

/// Sends events to a running [`RecommitController`] and observes its status.
#[derive(Debug, Clone)]
pub struct RecommitHandle {
    events: mpsc::UnboundedSender<RecommitEvent>,
    status: watch::Receiver<RecommitStatus>,
}

impl RecommitHandle {
    /// Returns false once the controller has stopped.
    pub fn send(&self, event: RecommitEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn new_head(&self) -> bool {
        self.send(RecommitEvent::NewHead)
    }

    pub fn new_transactions(&self) -> bool {
        self.send(RecommitEvent::NewTransactions)
    }

    pub fn recommit(&self) -> bool {
        self.send(RecommitEvent::Recommit)
    }

    pub fn increase(&self, ratio: f64) -> bool {
        self.send(RecommitEvent::Increase(ratio))
    }

    pub fn decrease(&self) -> bool {
        self.send(RecommitEvent::Decrease)
    }

    pub fn set_interval(&self, interval: Duration) -> bool {
        self.send(RecommitEvent::SetInterval(interval))
    }

    pub fn shutdown(&self) -> bool {
        self.send(RecommitEvent::Shutdown)
    }

    pub fn status(&self) -> RecommitStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecommitStatus> {
        self.status.clone()
    }
}

struct InFlight {
    id: u64,
    cancel: CancellationToken,
    started: Instant,
    /// Cancelled by a tick so that newer orders get picked up.
    resubmit: bool,
}

struct Finished {
    id: u64,
    result: Result<Result<BuildSummary, BuildError>, JoinError>,
}

/// Decides when to run the next block building attempt.
///
/// At most one attempt runs at a time. A new head or an explicit recommit cancels the
/// running attempt and starts a fresh one. New transactions only mark the controller
/// dirty; the next tick of the recommit timer turns any number of them into one attempt,
/// interrupting a running one if needed. Interrupted attempts grow the interval by their
/// fill ratio, completed ones shrink it back toward the minimum.
pub struct RecommitController<T> {
    task: Arc<T>,
    interval: RecommitInterval,
    events: mpsc::UnboundedReceiver<RecommitEvent>,
    status: watch::Sender<RecommitStatus>,
    next_id: u64,
    metrics: RecommitMetrics,
}

impl<T> core::fmt::Debug for RecommitController<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecommitController")
            .field("interval", &self.interval)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl<T: BuildTask> RecommitController<T> {
    pub fn new(task: T, interval: RecommitInterval) -> (Self, RecommitHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RecommitStatus {
            min_interval: interval.min(),
            recommit_interval: interval.current(),
            ..Default::default()
        });

        let controller = Self {
            task: Arc::new(task),
            interval,
            events: events_rx,
            status: status_tx,
            next_id: 0,
            metrics: RecommitMetrics::default(),
        };
        controller.metrics.recommit_interval.set(interval.current().as_secs_f64());

        (controller, RecommitHandle { events: events_tx, status: status_rx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until [`RecommitEvent::Shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Finished>();
        let mut in_flight: Option<InFlight> = None;
        let mut dirty = false;

        let timer = tokio::time::sleep(self.interval.current());
        tokio::pin!(timer);

        info!(target: "builder::recommit", interval = ?self.interval.current(), "Starting recommit loop");

        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    debug!(target: "builder::recommit", ?event, "Received event");

                    match event {
                        RecommitEvent::NewHead | RecommitEvent::Recommit => {
                            if let Some(job) = in_flight.take() {
                                debug!(target: "builder::recommit", id = job.id, "Superseding running attempt");
                                job.cancel.cancel();
                                self.metrics.superseded_builds.increment(1);
                            }
                            dirty = false;
                            in_flight = Some(self.start(&done_tx));
                            timer.as_mut().reset(Instant::now() + self.interval.current());
                        }
                        RecommitEvent::NewTransactions => dirty = true,
                        RecommitEvent::Increase(ratio) => {
                            self.interval.increase(ratio);
                            self.publish_interval();
                        }
                        RecommitEvent::Decrease => {
                            self.interval.decrease();
                            self.publish_interval();
                        }
                        RecommitEvent::SetInterval(interval) => {
                            let applied = self.interval.set(interval);
                            info!(target: "builder::recommit", requested = ?interval, ?applied, "Recommit interval set");
                            self.publish_interval();
                            timer.as_mut().reset(Instant::now() + self.interval.current());
                        }
                        RecommitEvent::Shutdown => break,
                    }
                }

                Some(finished) = done_rx.recv() => {
                    // results of superseded attempts are discarded
                    let Some(job) = in_flight.take_if(|job| job.id == finished.id) else { continue };
                    let resubmit = job.resubmit;
                    self.finish(job, finished.result);

                    if resubmit && dirty {
                        dirty = false;
                        in_flight = Some(self.start(&done_tx));
                    }
                }

                () = &mut timer => {
                    if dirty {
                        if let Some(job) = in_flight.as_mut() {
                            debug!(target: "builder::recommit", id = job.id, "Interrupting attempt to pick up new orders");
                            job.resubmit = true;
                            job.cancel.cancel();
                        } else {
                            dirty = false;
                            in_flight = Some(self.start(&done_tx));
                        }
                    }
                    timer.as_mut().reset(Instant::now() + self.interval.current());
                }
            }
        }

        if let Some(job) = in_flight.take() {
            job.cancel.cancel();
        }
        self.status.send_modify(|status| status.state = ControllerState::Idle);
        info!(target: "builder::recommit", "Recommit loop stopped");
    }

    fn start(&mut self, done: &mpsc::UnboundedSender<Finished>) -> InFlight {
        let id = self.next_id;
        self.next_id += 1;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = self.task.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || task.build(token)).await;
            let _ = done.send(Finished { id, result });
        });

        self.metrics.builds_started.increment(1);
        self.status.send_modify(|status| status.state = ControllerState::Assembling);
        debug!(target: "builder::recommit", id, "Started attempt");

        InFlight { id, cancel, started: Instant::now(), resubmit: false }
    }

    fn finish(&mut self, job: InFlight, result: Result<Result<BuildSummary, BuildError>, JoinError>) {
        let elapsed = job.started.elapsed();
        self.metrics.build_duration.record(elapsed.as_secs_f64());

        let mut completed = 0;
        let mut failed = 0;
        let mut interrupted = 0;

        match result {
            Ok(Ok(summary)) => {
                completed = 1;
                self.interval.decrease();
                debug!(
                    target: "builder::recommit",
                    id = job.id,
                    ?elapsed,
                    gas_used = summary.gas_used,
                    transactions = summary.transactions,
                    "Attempt completed"
                );
            }
            Ok(Err(err)) if job.resubmit && err.is_cancelled() => {
                interrupted = 1;
                let ratio = err.fill_ratio().unwrap_or_default();
                self.interval.increase(ratio);
                self.metrics.interrupted_builds.increment(1);
                debug!(target: "builder::recommit", id = job.id, ratio, interval = ?self.interval.current(), "Attempt interrupted");
            }
            Ok(Err(err)) => {
                failed = 1;
                self.metrics.failed_builds.increment(1);
                warn!(target: "builder::recommit", id = job.id, %err, ?elapsed, "Attempt failed");
            }
            Err(err) => {
                failed = 1;
                self.metrics.failed_builds.increment(1);
                error!(target: "builder::recommit", id = job.id, %err, "Attempt panicked");
            }
        }

        let interval = self.interval;
        self.metrics.recommit_interval.set(interval.current().as_secs_f64());
        self.status.send_modify(|status| {
            status.state = ControllerState::WaitingInterval;
            status.min_interval = interval.min();
            status.recommit_interval = interval.current();
            status.completed += completed;
            status.failed += failed;
            status.interrupted += interrupted;
            status.last_duration = Some(elapsed);
        });
    }

    fn publish_interval(&self) {
        let interval = self.interval;
        self.metrics.recommit_interval.set(interval.current().as_secs_f64());
        self.status.send_modify(|status| {
            status.min_interval = interval.min();
            status.recommit_interval = interval.current();
        });
    }
}

/// Metrics for the recommit loop.
pub(crate) struct RecommitMetrics {
    pub(crate) recommit_interval: Gauge,
    pub(crate) build_duration: Histogram,
    pub(crate) builds_started: Counter,
    pub(crate) failed_builds: Counter,
    pub(crate) interrupted_builds: Counter,
    pub(crate) superseded_builds: Counter,
}

impl Default for RecommitMetrics {
    fn default() -> Self {
        Self {
            recommit_interval: metrics::gauge!("builder.recommit.interval"),
            build_duration: metrics::histogram!("builder.recommit.build_duration"),
            builds_started: metrics::counter!("builder.recommit.builds_started"),
            failed_builds: metrics::counter!("builder.recommit.failed_builds"),
            interrupted_builds: metrics::counter!("builder.recommit.interrupted_builds"),
            superseded_builds: metrics::counter!("builder.recommit.superseded_builds"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        assembler::BuiltBlock,
        constraints::ConstraintCache,
        test_utils::{GENESIS_GAS_LIMIT, GENESIS_TIMESTAMP, MockExecutor, mock_executor, signer, transfer},
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_interval() -> RecommitInterval {
        RecommitInterval::new(
            Duration::from_millis(50),
            Duration::from_secs(1),
            Duration::from_millis(10),
            0.1,
            Duration::ZERO,
        )
    }

    fn summary() -> BuildSummary {
        BuildSummary { gas_used: 21_000, gas_limit: GENESIS_GAS_LIMIT, transactions: 1, ..Default::default() }
    }

    /// Blocks until cancelled, then reports a half full block.
    fn wait_for_cancel(cancel: &CancellationToken) -> Result<BuildSummary, BuildError> {
        let start = std::time::Instant::now();
        while !cancel.is_cancelled() && start.elapsed() < WAIT {
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(BuildError::Cancelled { gas_used: GENESIS_GAS_LIMIT / 2, gas_limit: GENESIS_GAS_LIMIT })
    }

    fn task<F>(f: F) -> F
    where
        F: Fn(CancellationToken) -> Result<BuildSummary, BuildError> + Send + Sync + 'static,
    {
        f
    }

    async fn wait_until(handle: &RecommitHandle, f: impl FnMut(&RecommitStatus) -> bool) -> RecommitStatus {
        let mut status = handle.subscribe();
        tokio::time::timeout(WAIT, status.wait_for(f)).await.unwrap().unwrap().clone()
    }

    #[tokio::test]
    async fn test_new_head_triggers_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (controller, handle) = RecommitController::new(
            task(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(summary())
            }),
            fast_interval(),
        );
        let join = controller.spawn();

        assert_eq!(handle.status().state, ControllerState::Idle);
        handle.new_head();
        let status = wait_until(&handle, |s| s.completed == 1).await;

        assert_eq!(status.state, ControllerState::WaitingInterval);
        assert!(status.last_duration.is_some());
        assert_eq!(status.recommit_interval, Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.shutdown();
        tokio::time::timeout(WAIT, join).await.unwrap().unwrap();
        assert_eq!(handle.status().state, ControllerState::Idle);
        assert!(!handle.new_head());
    }

    #[tokio::test]
    async fn test_transaction_burst_is_coalesced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (controller, handle) = RecommitController::new(
            task(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(summary())
            }),
            fast_interval(),
        );
        controller.spawn();

        handle.new_head();
        wait_until(&handle, |s| s.completed == 1).await;

        for _ in 0..10 {
            handle.new_transactions();
        }
        wait_until(&handle, |s| s.completed == 2).await;

        // a few more ticks without new orders
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.status().completed, 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_loop_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (controller, handle) = RecommitController::new(
            task(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(BuildError::InvalidParent(Default::default()))
                } else {
                    Ok(summary())
                }
            }),
            fast_interval(),
        );
        controller.spawn();

        handle.new_head();
        let status = wait_until(&handle, |s| s.failed == 1).await;
        assert_eq!(status.completed, 0);
        // failures leave the interval alone
        assert_eq!(status.recommit_interval, Duration::from_millis(50));

        handle.recommit();
        let status = wait_until(&handle, |s| s.completed == 1).await;
        assert_eq!(status.failed, 1);
    }

    #[tokio::test]
    async fn test_new_head_supersedes_running_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stale_cancelled = Arc::new(AtomicBool::new(false));
        let (counter, flag) = (calls.clone(), stale_cancelled.clone());
        let (controller, handle) = RecommitController::new(
            task(move |cancel| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let result = wait_for_cancel(&cancel);
                    flag.store(cancel.is_cancelled(), Ordering::SeqCst);
                    result
                } else {
                    Ok(summary())
                }
            }),
            fast_interval(),
        );
        controller.spawn();

        handle.new_head();
        wait_until(&handle, |s| s.state == ControllerState::Assembling).await;
        tokio::time::timeout(WAIT, async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        handle.new_head();

        let status = wait_until(&handle, |s| s.completed == 1).await;
        assert_eq!(status.interrupted, 0);

        tokio::time::timeout(WAIT, async {
            while !stale_cancelled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // the stale result is dropped
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = handle.status();
        assert_eq!((status.completed, status.failed, status.interrupted), (1, 0, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_interrupted_attempt_increases_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (controller, handle) = RecommitController::new(
            task(move |cancel| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 { wait_for_cancel(&cancel) } else { Ok(summary()) }
            }),
            fast_interval(),
        );
        controller.spawn();

        handle.new_head();
        handle.new_transactions();

        // interrupted on the first tick, then rebuilt with the new orders
        let status = wait_until(&handle, |s| s.completed == 1).await;
        assert_eq!(status.interrupted, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // 50ms grows to 55ms, the completed rebuild brings it back to about 54.5ms
        assert!(status.recommit_interval > Duration::from_millis(54));
        assert!(status.recommit_interval < Duration::from_millis(55));
    }

    #[tokio::test]
    async fn test_interval_signals() {
        let (controller, handle) = RecommitController::new(task(|_| Ok(summary())), RecommitInterval::default());
        controller.spawn();

        handle.set_interval(Duration::from_millis(500));
        let status = wait_until(&handle, |s| s.min_interval == Duration::from_secs(1)).await;
        assert_eq!(status.recommit_interval, Duration::from_secs(1));

        handle.increase(0.5);
        let status = wait_until(&handle, |s| s.recommit_interval > Duration::from_secs(1)).await;
        let increased = status.recommit_interval;

        handle.decrease();
        let status = wait_until(&handle, |s| s.recommit_interval < increased).await;
        assert!(status.recommit_interval >= Duration::from_secs(1));
        assert_eq!(status.completed, 0);
    }

    struct StaticSource {
        params: GenerateParams,
        orders: Vec<OrderWithArrival>,
    }

    impl OrderSource for StaticSource {
        fn params(&self) -> GenerateParams {
            self.params.clone()
        }

        fn orders(&self) -> Vec<OrderWithArrival> {
            self.orders.clone()
        }
    }

    #[tokio::test]
    async fn test_assembly_task() {
        let executor: Arc<MockExecutor> = mock_executor(2);
        let sealed: Arc<Mutex<Vec<BuiltBlock>>> = Arc::default();
        let sink = sealed.clone();

        let assembler = Arc::new(BlockAssembler::new(
            executor.clone(),
            Arc::new(ConstraintCache::default()),
            Arc::default(),
        ));
        let source = StaticSource {
            params: GenerateParams {
                parent_hash: executor.genesis_hash(),
                timestamp: GENESIS_TIMESTAMP + 12,
                gas_limit: GENESIS_GAS_LIMIT,
                on_block: Some(Arc::new(move |block: &BuiltBlock| sink.lock().unwrap().push(block.clone()))),
                ..Default::default()
            },
            orders: vec![
                OrderWithArrival::tx(0, transfer(&signer(1), 0, 1)),
                OrderWithArrival::tx(1, transfer(&signer(2), 0, 2)),
            ],
        };

        let (controller, handle) = RecommitController::new(AssemblyTask::new(assembler, source), fast_interval());
        controller.spawn();

        handle.new_head();
        let status = wait_until(&handle, |s| s.completed == 1).await;
        assert_eq!(status.failed, 0);

        let sealed = sealed.lock().unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].transactions.len(), 2);
        assert_eq!(sealed[0].header.gas_used, 2 * 21_000);
    }
}
