//! The worker process (spec.md §4.3, C5): subscribes to the announcement
//! channel, pulls batches from the task channel, and fans a batch of tasks
//! out across `n_procs` local threads in the column-major layout spec.md
//! §4.3 describes — thread `i` runs row `i` of the batch sequentially.
//! Grounded on `nailgun::client`'s short-lived request/reply connections and
//! `process_execution::bounded`'s semaphore-gated local concurrency.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use task_executor::Executor;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use wess_dispatch::wire::{read_frame, write_frame};
use wess_dispatch::{AnnounceMsg, ClientMsg, TaskEnvelope, TaskReplyMsg, TaskRequestMsg, WorkerResultMsg};
use wess_workmanager::Propagator;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode/decode a wire message: {0}")]
    Codec(#[from] bincode::Error),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] wess_dispatch::Error),
}

/// Local tuning knobs; `n_procs` defaults to the number of logical CPUs
/// rather than a silent hardcoded value, mirroring
/// `task_executor::Executor::new_owned`'s explicit thread counts.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub n_procs: usize,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            n_procs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            retry_limit: 5,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

pub struct Worker<P> {
    propagator: Arc<P>,
    executor: Executor,
    config: WorkerConfig,
    fanout: Arc<Semaphore>,
}

impl<P: Propagator + Send + Sync + 'static> Worker<P> {
    pub fn new(propagator: P, executor: Executor, config: WorkerConfig) -> Worker<P> {
        let fanout = Arc::new(Semaphore::new(config.n_procs.max(1)));
        Worker {
            propagator: Arc::new(propagator),
            executor,
            config,
            fanout,
        }
    }

    /// Subscribes to the announcement channel and, on every `Wake`, drains
    /// the task channel until it reports `NoWork`. Returns once the
    /// dispatcher announces `Shutdown` or the connection is closed.
    pub async fn run(&self, announce_addr: SocketAddr, task_addr: SocketAddr) -> Result<(), Error> {
        let mut announce = TcpStream::connect(announce_addr).await?;
        loop {
            let msg: AnnounceMsg = match read_frame(&mut announce).await {
                Ok(m) => m,
                Err(_) => {
                    log::info!("announcement connection closed; worker exiting");
                    return Ok(());
                }
            };
            match msg {
                AnnounceMsg::Wake => self.drain_tasks(task_addr).await,
                AnnounceMsg::Shutdown => {
                    log::info!("dispatcher announced shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Retries task-channel connection failures a bounded number of times
    /// with a fixed backoff; gives up on this announcement cycle and returns
    /// to listening rather than treating it as fatal to the whole worker.
    async fn drain_tasks(&self, task_addr: SocketAddr) {
        let mut attempt = 0;
        loop {
            match self.try_drain_tasks(task_addr).await {
                Ok(()) => return,
                Err(e) => {
                    attempt += 1;
                    log::warn!(
                        "task channel error on attempt {attempt}/{}: {e}",
                        self.config.retry_limit
                    );
                    if attempt >= self.config.retry_limit {
                        log::error!("giving up on this announcement cycle after {attempt} attempts");
                        return;
                    }
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    async fn try_drain_tasks(&self, task_addr: SocketAddr) -> Result<(), Error> {
        let mut stream = TcpStream::connect(task_addr).await?;
        loop {
            // Request as many tasks as there are local worker threads
            // (spec.md §4.3: "issues request n_procs").
            write_frame(
                &mut stream,
                &ClientMsg::Request(TaskRequestMsg::RequestBatch {
                    max_batch: self.config.n_procs.max(1),
                }),
            )
            .await?;
            let reply: TaskReplyMsg = read_frame(&mut stream).await?;
            let tasks = match reply {
                TaskReplyMsg::NoWork => return Ok(()),
                TaskReplyMsg::Batch { tasks } => tasks,
                TaskReplyMsg::Ack => {
                    return Err(Error::Codec(Box::new(bincode::ErrorKind::Custom(
                        "unexpected Ack in reply to a task request".into(),
                    ))))
                }
            };
            if tasks.is_empty() {
                return Ok(());
            }

            let results = self.run_tasks(tasks).await;
            write_frame(&mut stream, &ClientMsg::Results(results)).await?;
            match read_frame::<_, TaskReplyMsg>(&mut stream).await? {
                TaskReplyMsg::Ack => {}
                _ => {
                    return Err(Error::Codec(Box::new(bincode::ErrorKind::Custom(
                        "expected Ack in reply to posted results".into(),
                    ))))
                }
            }
        }
    }

    /// Runs one task in full, off the async runtime. Per Open Question (b),
    /// a propagator that returns fewer segments than it was given surfaces
    /// the shortfall as an `Exception` naming the missing seg_ids, and a
    /// propagator error fails the whole task.
    fn run_task_sync(propagator: &dyn Propagator, task: &TaskEnvelope) -> WorkerResultMsg {
        match propagator.propagate(&task.segments) {
            Ok(segments) => {
                let returned: std::collections::HashSet<u32> =
                    segments.iter().map(|s| s.seg_id).collect();
                let missing: Vec<u32> = task
                    .segments
                    .iter()
                    .map(|s| s.seg_id)
                    .filter(|id| !returned.contains(id))
                    .collect();
                if missing.is_empty() {
                    WorkerResultMsg::Completed {
                        task_id: task.task_id,
                        segments,
                    }
                } else {
                    WorkerResultMsg::Exception {
                        task_id: task.task_id,
                        failed_seg_ids: missing,
                        message: "propagator returned fewer segments than it was given".into(),
                    }
                }
            }
            Err(e) => WorkerResultMsg::Exception {
                task_id: task.task_id,
                failed_seg_ids: task.segments.iter().map(|s| s.seg_id).collect(),
                message: e.to_string(),
            },
        }
    }

    #[cfg(test)]
    async fn run_task(&self, task: TaskEnvelope) -> WorkerResultMsg {
        self.run_tasks(vec![task]).await.into_iter().next().unwrap()
    }

    /// Arranges `k` received tasks into a column-major layout of `n_procs`
    /// rows (spec.md §4.3): task `i` lands in row `i % n_procs`, so each
    /// thread executes a strided subsequence of the batch sequentially.
    /// Results are concatenated in thread (row) order, not task-arrival
    /// order — the submitter reconciles by seg_id, not by position.
    async fn run_tasks(&self, tasks: Vec<TaskEnvelope>) -> Vec<WorkerResultMsg> {
        let n_procs = self.config.n_procs.max(1);
        let mut rows: Vec<Vec<TaskEnvelope>> = (0..n_procs).map(|_| Vec::new()).collect();
        for (i, task) in tasks.into_iter().enumerate() {
            rows[i % n_procs].push(task);
        }

        let row_futures = rows.into_iter().filter(|row| !row.is_empty()).map(|row| {
            let propagator = self.propagator.clone();
            let fanout = self.fanout.clone();
            let executor = self.executor.clone();
            async move {
                let _permit = fanout
                    .acquire_owned()
                    .await
                    .expect("fanout semaphore is never closed");
                executor
                    .spawn_blocking(
                        move || {
                            row.iter()
                                .map(|task| Self::run_task_sync(propagator.as_ref(), task))
                                .collect::<Vec<_>>()
                        },
                        |join_error| {
                            vec![WorkerResultMsg::Exception {
                                task_id: u64::MAX,
                                failed_seg_ids: Vec::new(),
                                message: format!("worker thread panicked: {join_error}"),
                            }]
                        },
                    )
                    .await
            }
        });

        futures::future::join_all(row_futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
