//! Concurrency scheduler
//!
//! Maps each node's concurrency policy onto execution lanes:
//!
//! - `parallelizable`: every job is spawned on its own task
//! - `sequential`: one FIFO lane and one mutex per node_id
//! - `strictly_sequential`: one global FIFO lane; while one of its jobs runs
//!   nothing else in the runtime executes
//!
//! Exclusion goes through a single runtime gate. Ordinary work holds it
//! shared and strictly sequential work holds it exclusively. All work is
//! bounded by a worker semaphore (`max_workers`, `None` for unbounded).
//!
//! Slots are always taken in the same order: worker permit, then gate, then
//! node mutex. Work invoked inline from a running job (orchestrator steps)
//! reuses the slots the job already holds. A job holding the gate shared
//! steps out of it to run strictly sequential work inline, which is refused
//! while it holds a node mutex.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::contract::ConcurrencyPolicy;
use crate::error::{HostError, Result};

type Job = BoxFuture<'static, ()>;

/// Shared gate guard that inline exclusive work can hand back temporarily
type SharedGate = Arc<parking_lot::Mutex<Option<OwnedRwLockReadGuard<()>>>>;

#[derive(Clone, Default)]
enum GateHold {
    #[default]
    None,
    Shared(SharedGate),
    Exclusive,
}

impl GateHold {
    fn shared(guard: OwnedRwLockReadGuard<()>) -> Self {
        Self::Shared(Arc::new(parking_lot::Mutex::new(Some(guard))))
    }
}

/// Slots held by the current task
#[derive(Clone, Default)]
struct HeldSlots {
    worker: bool,
    gate: GateHold,
    nodes: BTreeSet<String>,
}

tokio::task_local! {
    static HELD: HeldSlots;
}

fn held_slots() -> HeldSlots {
    HELD.try_with(Clone::clone).unwrap_or_default()
}

struct Lanes {
    nodes: HashMap<String, mpsc::UnboundedSender<Job>>,
    global: mpsc::UnboundedSender<Job>,
    drains: Vec<JoinHandle<()>>,
}

pub struct ConcurrencyScheduler {
    max_workers: Option<usize>,
    workers: Option<Arc<Semaphore>>,
    policies: HashMap<String, ConcurrencyPolicy>,
    node_locks: HashMap<String, Arc<Mutex<()>>>,
    gate: Arc<RwLock<()>>,
    lanes: parking_lot::Mutex<Option<Lanes>>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for ConcurrencyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyScheduler")
            .field("max_workers", &self.max_workers)
            .field("nodes", &self.policies.len())
            .field("running", &self.is_running())
            .field("parallel_tasks", &self.tasks.len())
            .finish()
    }
}

impl ConcurrencyScheduler {
    pub fn new(max_workers: Option<usize>, policies: HashMap<String, ConcurrencyPolicy>) -> Self {
        let node_locks = policies
            .iter()
            .filter(|(_, p)| **p == ConcurrencyPolicy::Sequential)
            .map(|(id, _)| (id.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            max_workers,
            workers: max_workers.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            policies,
            node_locks,
            gate: Arc::new(RwLock::new(())),
            lanes: parking_lot::Mutex::new(None),
            tasks: TaskTracker::new(),
        }
    }

    pub fn max_workers(&self) -> Option<usize> {
        self.max_workers
    }

    pub fn policy(&self, node_id: &str) -> ConcurrencyPolicy {
        self.policies
            .get(node_id)
            .copied()
            .unwrap_or(ConcurrencyPolicy::Parallelizable)
    }

    pub fn is_running(&self) -> bool {
        self.lanes.lock().is_some()
    }

    /// Spawn one drain task per sequential node plus the global lane
    pub fn start(&self) -> Result<()> {
        let mut lanes = self.lanes.lock();
        if lanes.is_some() {
            return Err(HostError::InvalidLifecycle {
                from: "running".to_string(),
                to: "running".to_string(),
            });
        }
        self.tasks.reopen();

        let mut drains = Vec::new();
        let mut nodes = HashMap::new();
        for (node_id, lock) in &self.node_locks {
            let (tx, rx) = mpsc::unbounded_channel();
            drains.push(tokio::spawn(drain_lane(
                rx,
                self.workers.clone(),
                self.gate.clone(),
                LaneLock::Node(node_id.clone(), lock.clone()),
            )));
            nodes.insert(node_id.clone(), tx);
        }
        let (global, rx) = mpsc::unbounded_channel();
        drains.push(tokio::spawn(drain_lane(
            rx,
            self.workers.clone(),
            self.gate.clone(),
            LaneLock::Exclusive,
        )));

        tracing::info!(
            max_workers = ?self.max_workers,
            sequential_lanes = nodes.len(),
            "scheduler started"
        );
        *lanes = Some(Lanes { nodes, global, drains });
        Ok(())
    }

    /// Queue `work` on the lane for `node_id`
    ///
    /// The receiver resolves once the work has run. Jobs queued on one lane
    /// run in submission order.
    pub fn submit<F, T>(&self, node_id: &str, work: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let _ = tx.send(work.await);
        }
        .boxed();

        let lanes = self.lanes.lock();
        let lanes = lanes.as_ref().ok_or(HostError::SchedulerClosed)?;
        match self.policy(node_id) {
            ConcurrencyPolicy::Parallelizable => {
                let workers = self.workers.clone();
                let gate = self.gate.clone();
                self.tasks.spawn(async move {
                    let Ok(permit) = acquire_worker(workers).await else {
                        return;
                    };
                    let held = HeldSlots {
                        worker: true,
                        gate: GateHold::shared(gate.read_owned().await),
                        nodes: BTreeSet::new(),
                    };
                    HELD.scope(held, job).await;
                    drop(permit);
                });
            }
            ConcurrencyPolicy::Sequential => {
                let lane = lanes.nodes.get(node_id).ok_or(HostError::SchedulerClosed)?;
                lane.send(job).map_err(|_| HostError::SchedulerClosed)?;
            }
            ConcurrencyPolicy::StrictlySequential => {
                lanes.global.send(job).map_err(|_| HostError::SchedulerClosed)?;
            }
        }
        Ok(rx)
    }

    /// Run `work` for `node_id` on the current task
    ///
    /// Takes whatever slots the node's policy requires and the current task
    /// does not already hold.
    pub async fn run_inline<F, T>(&self, node_id: &str, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let mut held = held_slots();
        let _permit = if held.worker {
            None
        } else {
            held.worker = true;
            acquire_worker(self.workers.clone()).await?
        };

        let policy = self.policy(node_id);
        if policy == ConcurrencyPolicy::StrictlySequential {
            return self.run_exclusive(node_id, held, work).await;
        }

        if matches!(held.gate, GateHold::None) {
            held.gate = GateHold::shared(self.gate.clone().read_owned().await);
        }
        let _node: Option<OwnedMutexGuard<()>> = match self.node_locks.get(node_id) {
            Some(lock) if policy == ConcurrencyPolicy::Sequential && !held.nodes.contains(node_id) => {
                held.nodes.insert(node_id.to_string());
                Some(lock.clone().lock_owned().await)
            }
            _ => None,
        };

        Ok(HELD.scope(held, work).await)
    }

    async fn run_exclusive<F, T>(&self, node_id: &str, mut held: HeldSlots, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if matches!(held.gate, GateHold::Exclusive) {
            return Ok(HELD.scope(held, work).await);
        }
        if let Some(lane) = held.nodes.iter().next() {
            return Err(HostError::LaneConflict {
                node_id: node_id.to_string(),
                held: lane.clone(),
            });
        }

        let stepped_out = match &held.gate {
            GateHold::Shared(slot) => {
                drop(slot.lock().take());
                Some(slot.clone())
            }
            _ => None,
        };
        let exclusive = self.gate.clone().write_owned().await;
        held.gate = GateHold::Exclusive;
        let output = HELD.scope(held, work).await;
        drop(exclusive);

        if let Some(slot) = stepped_out {
            let guard = self.gate.clone().read_owned().await;
            *slot.lock() = Some(guard);
        }
        Ok(output)
    }

    /// Stop accepting work and wait for queued and spawned jobs to finish
    pub async fn shutdown(&self) {
        let Some(lanes) = self.lanes.lock().take() else {
            return;
        };
        let Lanes { nodes, global, drains } = lanes;
        drop(nodes);
        drop(global);
        for drain in drains {
            if let Err(e) = drain.await {
                tracing::warn!(error = %e, "lane drain task failed");
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("scheduler stopped");
    }
}

enum LaneLock {
    Node(String, Arc<Mutex<()>>),
    Exclusive,
}

async fn acquire_worker(workers: Option<Arc<Semaphore>>) -> Result<Option<OwnedSemaphorePermit>> {
    match workers {
        Some(semaphore) => semaphore
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| HostError::SchedulerClosed),
        None => Ok(None),
    }
}

/// Run lane jobs one at a time, in arrival order
async fn drain_lane(
    mut rx: mpsc::UnboundedReceiver<Job>,
    workers: Option<Arc<Semaphore>>,
    gate: Arc<RwLock<()>>,
    lock: LaneLock,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = acquire_worker(workers.clone()).await else {
            break;
        };
        let mut exclusive = None;
        let mut node_guard = None;
        let held = match &lock {
            LaneLock::Node(node_id, mutex) => {
                let shared = GateHold::shared(gate.clone().read_owned().await);
                node_guard = Some(mutex.clone().lock_owned().await);
                HeldSlots {
                    worker: true,
                    gate: shared,
                    nodes: BTreeSet::from([node_id.clone()]),
                }
            }
            LaneLock::Exclusive => {
                exclusive = Some(gate.clone().write_owned().await);
                HeldSlots {
                    worker: true,
                    gate: GateHold::Exclusive,
                    nodes: BTreeSet::new(),
                }
            }
        };

        // A panicking job must not take the lane down with it
        if let Err(e) = tokio::spawn(HELD.scope(held, job)).await {
            tracing::error!(error = %e, "lane job panicked");
        }
        drop(node_guard);
        drop(exclusive);
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn policies(entries: &[(&str, ConcurrencyPolicy)]) -> HashMap<String, ConcurrencyPolicy> {
        entries.iter().map(|(id, p)| (id.to_string(), *p)).collect()
    }

    /// Tracks the highest number of jobs running at once
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Overlap {
        async fn run(&self, hold: Duration) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strictly_sequential_never_overlaps() {
        let scheduler = ConcurrencyScheduler::new(
            None,
            policies(&[
                ("audit_effect", ConcurrencyPolicy::StrictlySequential),
                ("ledger_effect", ConcurrencyPolicy::StrictlySequential),
            ]),
        );
        scheduler.start().unwrap();
        let overlap = Arc::new(Overlap::default());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..6 {
            let node = if i % 2 == 0 { "audit_effect" } else { "ledger_effect" };
            let overlap = overlap.clone();
            let order = order.clone();
            receivers.push(
                scheduler
                    .submit(node, async move {
                        overlap.run(Duration::from_millis(10)).await;
                        order.lock().push(i);
                    })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }

        assert_eq!(overlap.peak(), 1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_lanes_are_independent() {
        let scheduler = ConcurrencyScheduler::new(
            None,
            policies(&[
                ("a_reducer", ConcurrencyPolicy::Sequential),
                ("b_reducer", ConcurrencyPolicy::Sequential),
            ]),
        );
        scheduler.start().unwrap();
        let overlap = Arc::new(Overlap::default());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for (i, node) in ["a_reducer", "b_reducer", "a_reducer", "b_reducer"].iter().enumerate() {
            let overlap = overlap.clone();
            let order = order.clone();
            let label = node.to_string();
            receivers.push(
                scheduler
                    .submit(node, async move {
                        overlap.run(Duration::from_millis(10)).await;
                        order.lock().push((label, i));
                    })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }

        // Two lanes ran side by side; each kept its own order
        assert_eq!(overlap.peak(), 2);
        let a: Vec<usize> = order.lock().iter().filter(|(n, _)| n == "a_reducer").map(|(_, i)| *i).collect();
        assert_eq!(a, vec![0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_parallel_jobs() {
        let scheduler = ConcurrencyScheduler::new(Some(2), HashMap::new());
        scheduler.start().unwrap();
        let overlap = Arc::new(Overlap::default());

        let mut receivers = Vec::new();
        for _ in 0..5 {
            let overlap = overlap.clone();
            receivers.push(
                scheduler
                    .submit("parser_compute", async move { overlap.run(Duration::from_millis(10)).await })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(overlap.peak(), 2);
    }

    #[tokio::test]
    async fn test_inline_work_reuses_held_worker() {
        let scheduler = Arc::new(ConcurrencyScheduler::new(
            Some(1),
            policies(&[("index_reducer", ConcurrencyPolicy::Sequential)]),
        ));
        scheduler.start().unwrap();

        let inner = scheduler.clone();
        let rx = scheduler
            .submit("flow_orchestrator", async move {
                let first = inner.run_inline("index_reducer", async { 1 }).await.unwrap();
                let second = inner.run_inline("parser_compute", async { 2 }).await.unwrap();
                first + second
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_submit_requires_start() {
        let scheduler = ConcurrencyScheduler::new(None, HashMap::new());
        assert!(matches!(
            scheduler.submit("x_compute", async {}),
            Err(HostError::SchedulerClosed)
        ));

        scheduler.start().unwrap();
        assert!(scheduler.start().is_err());
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
        assert!(scheduler.submit("x_compute", async {}).is_err());
    }

    /// Flags any overlap between exclusive and ordinary jobs
    #[derive(Default)]
    struct Exclusion {
        exclusive: AtomicUsize,
        ordinary: Overlap,
        violations: AtomicUsize,
    }

    impl Exclusion {
        async fn exclusive(&self) {
            self.exclusive.fetch_add(1, Ordering::SeqCst);
            if self.ordinary.active.load(Ordering::SeqCst) > 0 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            sleep(Duration::from_millis(10)).await;
            if self.ordinary.active.load(Ordering::SeqCst) > 0 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            self.exclusive.fetch_sub(1, Ordering::SeqCst);
        }

        async fn ordinary(&self) {
            if self.exclusive.load(Ordering::SeqCst) > 0 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            self.ordinary.run(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strictly_sequential_excludes_other_lanes() {
        let scheduler = ConcurrencyScheduler::new(
            None,
            policies(&[
                ("audit_effect", ConcurrencyPolicy::StrictlySequential),
                ("index_reducer", ConcurrencyPolicy::Sequential),
            ]),
        );
        scheduler.start().unwrap();
        let exclusion = Arc::new(Exclusion::default());

        let mut receivers = Vec::new();
        for i in 0..12 {
            let exclusion = exclusion.clone();
            let rx = match i % 3 {
                0 => scheduler.submit("audit_effect", async move { exclusion.exclusive().await }),
                1 => scheduler.submit("index_reducer", async move { exclusion.ordinary().await }),
                _ => scheduler.submit("parser_compute", async move { exclusion.ordinary().await }),
            };
            receivers.push(rx.unwrap());
        }
        for rx in receivers {
            rx.await.unwrap();
        }

        assert_eq!(exclusion.violations.load(Ordering::SeqCst), 0);
        // Ordinary work still ran side by side between exclusive jobs
        assert!(exclusion.ordinary.peak() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_exclusive_waits_for_other_work() {
        let scheduler = Arc::new(ConcurrencyScheduler::new(
            None,
            policies(&[("audit_effect", ConcurrencyPolicy::StrictlySequential)]),
        ));
        scheduler.start().unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let slow = order.clone();
        let parse = scheduler
            .submit("parser_compute", async move {
                sleep(Duration::from_millis(50)).await;
                slow.lock().push("parse");
            })
            .unwrap();

        let inner = scheduler.clone();
        let steps = order.clone();
        let flow = scheduler
            .submit("flow_orchestrator", async move {
                let audited = inner
                    .run_inline("audit_effect", async { steps.lock().push("audit") })
                    .await;
                // Back on the shared gate after the exclusive step
                let indexed = inner.run_inline("index_compute", async { steps.lock().push("index") }).await;
                audited.and(indexed)
            })
            .unwrap();

        flow.await.unwrap().unwrap();
        parse.await.unwrap();
        assert_eq!(*order.lock(), vec!["parse", "audit", "index"]);
    }

    #[tokio::test]
    async fn test_inline_exclusive_refused_inside_node_lane() {
        let scheduler = Arc::new(ConcurrencyScheduler::new(
            Some(2),
            policies(&[
                ("audit_effect", ConcurrencyPolicy::StrictlySequential),
                ("flow_orchestrator", ConcurrencyPolicy::Sequential),
            ]),
        ));
        scheduler.start().unwrap();

        let inner = scheduler.clone();
        let rx = scheduler
            .submit("flow_orchestrator", async move { inner.run_inline("audit_effect", async {}).await })
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, HostError::LaneConflict { ref held, .. } if held == "flow_orchestrator"));
        assert_eq!(err.code(), "LANE_CONFLICT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_parallel_jobs() {
        let scheduler = ConcurrencyScheduler::new(Some(2), HashMap::new());
        scheduler.start().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = finished.clone();
            drop(
                scheduler
                    .submit("parser_compute", async move {
                        sleep(Duration::from_millis(20)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }

        scheduler.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }
}
