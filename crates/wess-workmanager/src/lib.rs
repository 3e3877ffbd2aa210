//! The `Propagate` facade (spec.md §4.4/§6, C3+C6): a pluggable `WorkManager`
//! trait with an in-process `SerialWorkManager` (used by tests and
//! single-machine runs) and a `DistributedWorkManager` that drives
//! `wess-dispatch`. Also defines the `SystemInfo`/`Propagator` external
//! collaborator traits.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use task_executor::Executor;
use thiserror::Error;
use wess_dispatch::{Dispatcher, TaskEnvelope, WorkerResultMsg};
use wess_model::{PcoordDtype, Segment};

#[derive(Debug, Error)]
pub enum PropagatorError {
    #[error("propagation failed for segment {seg_id}: {message}")]
    SegmentFailed { seg_id: u32, message: String },
    #[error("propagator error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Propagator(#[from] PropagatorError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] wess_dispatch::Error),
    #[error("worker reported a failure on task {task_id} for segments {failed_seg_ids:?}: {message}")]
    WorkerException {
        task_id: u64,
        failed_seg_ids: Vec<u32>,
        message: String,
    },
    #[error("work manager internal error: {0}")]
    Internal(String),
}

/// The fixed, run-level shape information every propagator and archive write
/// must agree on (spec.md §6's "System collaborator").
pub trait SystemInfo: Send + Sync {
    fn pcoord_ndim(&self) -> usize;
    fn pcoord_len(&self) -> usize;
    fn pcoord_dtype(&self) -> PcoordDtype;
    fn all_bins(&self) -> usize;
}

/// The simulation-specific collaborator that actually advances a segment's
/// trajectory. Implementations are expected to be CPU-bound and are always
/// invoked off the async runtime (via `spawn_blocking`).
pub trait Propagator: Send + Sync {
    fn propagate(&self, block: &[Segment]) -> Result<Vec<Segment>, PropagatorError>;
}

/// The facade the simulation driver calls once per iteration: hand it a
/// block of segments, get back their propagated successors.
#[async_trait]
pub trait WorkManager: Send + Sync {
    async fn propagate(
        &self,
        n_iter: u32,
        segments: &[Segment],
        blocksize: usize,
    ) -> Result<Vec<Segment>, Error>;
}

/// Runs propagation in-process, chunked onto the executor's blocking pool.
/// Used by property/integration tests and `wess run --serial`.
pub struct SerialWorkManager<P> {
    propagator: std::sync::Arc<P>,
    executor: Executor,
}

impl<P: Propagator + Send + Sync + 'static> SerialWorkManager<P> {
    pub fn new(propagator: P, executor: Executor) -> Self {
        SerialWorkManager {
            propagator: std::sync::Arc::new(propagator),
            executor,
        }
    }
}

#[async_trait]
impl<P: Propagator + Send + Sync + 'static> WorkManager for SerialWorkManager<P> {
    async fn propagate(
        &self,
        _n_iter: u32,
        segments: &[Segment],
        blocksize: usize,
    ) -> Result<Vec<Segment>, Error> {
        let blocksize = blocksize.max(1);
        let mut futures = Vec::new();
        for chunk in segments.chunks(blocksize) {
            let chunk = chunk.to_vec();
            let propagator = self.propagator.clone();
            futures.push(self.executor.spawn_blocking(
                move || propagator.propagate(&chunk),
                |join_error| {
                    Err(PropagatorError::Other(format!(
                        "propagation task panicked: {join_error}"
                    )))
                },
            ));
        }

        let mut out = Vec::with_capacity(segments.len());
        for fut in futures {
            out.extend(fut.await?);
        }
        Ok(out)
    }
}

/// Drives propagation over the network via `wess-dispatch`: splits the
/// iteration's segments into `blocksize`-sized tasks, enqueues them, and
/// drains results until every outgoing task id has been seen exactly once.
pub struct DistributedWorkManager {
    dispatcher: Dispatcher,
}

impl DistributedWorkManager {
    pub fn new(dispatcher: Dispatcher) -> Self {
        DistributedWorkManager { dispatcher }
    }
}

#[async_trait]
impl WorkManager for DistributedWorkManager {
    async fn propagate(
        &self,
        n_iter: u32,
        segments: &[Segment],
        blocksize: usize,
    ) -> Result<Vec<Segment>, Error> {
        let blocksize = blocksize.max(1);
        let mut tasks = Vec::new();
        let mut pending: HashSet<u64> = HashSet::new();
        for chunk in segments.chunks(blocksize) {
            let task_id = self.dispatcher.next_task_id();
            pending.insert(task_id);
            tasks.push(TaskEnvelope {
                task_id,
                n_iter,
                segments: chunk.to_vec(),
            });
        }
        let total_tasks = tasks.len();
        self.dispatcher.enqueue(tasks).await;
        log::debug!("propagate: enqueued {total_tasks} tasks for iteration {n_iter}");

        let mut by_seg_id: HashMap<u32, Segment> = HashMap::new();
        while !pending.is_empty() {
            match self.dispatcher.recv_result().await? {
                WorkerResultMsg::Completed { task_id, segments } => {
                    if !pending.remove(&task_id) {
                        log::warn!("ignoring duplicate result for task {task_id}");
                        continue;
                    }
                    for seg in segments {
                        by_seg_id.insert(seg.seg_id, seg);
                    }
                }
                WorkerResultMsg::Exception {
                    task_id,
                    failed_seg_ids,
                    message,
                } => {
                    pending.remove(&task_id);
                    return Err(Error::WorkerException {
                        task_id,
                        failed_seg_ids,
                        message,
                    });
                }
            }
        }

        segments
            .iter()
            .map(|seg| {
                by_seg_id.remove(&seg.seg_id).ok_or_else(|| {
                    Error::Internal(format!(
                        "no result returned for segment {} in iteration {n_iter}",
                        seg.seg_id
                    ))
                })
            })
            .collect()
    }
}
