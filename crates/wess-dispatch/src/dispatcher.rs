use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use task_executor::Executor;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

use crate::wire::{self, AnnounceMsg, ClientMsg, TaskEnvelope, TaskReplyMsg, TaskRequestMsg, WorkerResultMsg};
use crate::Error;

/// Encodes Open Question (a): the announcement cadence is reset to "due
/// immediately" whenever fresh work lands on an empty queue, rather than
/// waiting out the rest of the current interval.
struct AnnounceGate {
    interval: Duration,
    last: StdMutex<Option<Instant>>,
}

impl AnnounceGate {
    fn new(interval: Duration) -> Self {
        AnnounceGate {
            interval,
            last: StdMutex::new(None),
        }
    }

    fn reset(&self) {
        *self.last.lock().unwrap() = None;
    }

    fn due(&self) -> bool {
        match *self.last.lock().unwrap() {
            None => true,
            Some(t) => t.elapsed() >= self.interval,
        }
    }

    fn mark_sent(&self) {
        *self.last.lock().unwrap() = Some(Instant::now());
    }
}

struct Inner {
    task_queue: Mutex<VecDeque<TaskEnvelope>>,
    results_queue: Mutex<VecDeque<WorkerResultMsg>>,
    results_notify: Notify,
    announce_subscribers: Mutex<Vec<TcpStream>>,
    announce_gate: AnnounceGate,
    last_contact: StdMutex<Instant>,
    shutdown_notify: Notify,
    shutdown_flag: AtomicBool,
    shutdown_exit_code: AtomicI32,
    check_interval: Duration,
    abort_interval: Duration,
    next_task_id: AtomicU64,
}

/// The dispatcher's queues and liveness state, shared between the accept
/// loops and the caller driving `Propagate` (spec.md §5: one shared state
/// machine, several tokio tasks reading and writing it).
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// A handle returned once `serve` has bound its listeners, so callers can
/// wait for the dispatcher to shut down and learn its exit code.
pub struct DispatcherHandle {
    pub announce_addr: SocketAddr,
    pub task_addr: SocketAddr,
    join: tokio::task::JoinHandle<Result<i32, Error>>,
}

impl DispatcherHandle {
    pub async fn wait(self) -> Result<i32, Error> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("dispatcher task panicked: {e}")))?
    }
}

impl Dispatcher {
    pub fn new(check_interval: Duration, announce_interval: Duration, abort_interval: Duration) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                task_queue: Mutex::new(VecDeque::new()),
                results_queue: Mutex::new(VecDeque::new()),
                results_notify: Notify::new(),
                announce_subscribers: Mutex::new(Vec::new()),
                announce_gate: AnnounceGate::new(announce_interval),
                last_contact: StdMutex::new(Instant::now()),
                shutdown_notify: Notify::new(),
                shutdown_flag: AtomicBool::new(false),
                shutdown_exit_code: AtomicI32::new(0),
                check_interval,
                abort_interval,
                next_task_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn next_task_id(&self) -> u64 {
        self.inner.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Places newly-submitted tasks on the queue and resets the announcement
    /// gate so the next tick wakes subscribers immediately.
    pub async fn enqueue(&self, tasks: Vec<TaskEnvelope>) {
        let mut queue = self.inner.task_queue.lock().await;
        let was_empty = queue.is_empty();
        queue.extend(tasks);
        drop(queue);
        if was_empty {
            self.inner.announce_gate.reset();
        }
    }

    /// Pulls up to `max_batch` tasks off the queue. Used by the task-channel
    /// connection handler, and directly by in-process workers that skip the
    /// network entirely (e.g. `SerialWorkManager`-adjacent test harnesses).
    pub async fn pull_batch(&self, max_batch: usize) -> Vec<TaskEnvelope> {
        let mut queue = self.inner.task_queue.lock().await;
        let n = max_batch.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Reports a worker's outcome for one task; wakes anyone blocked in
    /// `recv_result`.
    pub async fn report_result(&self, msg: WorkerResultMsg) {
        self.inner.results_queue.lock().await.push_back(msg);
        self.inner.results_notify.notify_one();
    }

    fn record_contact(&self) {
        *self.inner.last_contact.lock().unwrap() = Instant::now();
    }

    /// Blocks until a worker result is available, the dispatcher is shut
    /// down, or `abort_interval` elapses with no worker contact at all
    /// (spec.md §4.2's `NoClients` condition).
    pub async fn recv_result(&self) -> Result<WorkerResultMsg, Error> {
        loop {
            if let Some(msg) = self.inner.results_queue.lock().await.pop_front() {
                return Ok(msg);
            }
            if self.inner.shutdown_flag.load(Ordering::Acquire) {
                return Err(Error::Internal("dispatcher shut down while waiting for a result".into()));
            }
            let since_contact = self.inner.last_contact.lock().unwrap().elapsed();
            if since_contact >= self.inner.abort_interval {
                return Err(Error::NoClients);
            }
            let remaining = self.inner.abort_interval.saturating_sub(since_contact);
            let timeout = remaining.min(self.inner.check_interval);
            let _ = tokio::time::timeout(timeout, self.inner.results_notify.notified()).await;
        }
    }

    pub fn shutdown(&self, exit_code: i32) {
        self.inner.shutdown_exit_code.store(exit_code, Ordering::Release);
        self.inner.shutdown_flag.store(true, Ordering::Release);
        self.inner.shutdown_notify.notify_waiters();
        self.inner.results_notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown_flag.load(Ordering::Acquire)
    }

    /// Binds both channels and spawns the accept loops plus the periodic
    /// announcement tick, in the style of `nailgun::server`'s bind-then-spawn
    /// setup. Returns once both listeners are bound; `DispatcherHandle::wait`
    /// resolves when the dispatcher itself shuts down.
    pub async fn serve(
        &self,
        executor: &Executor,
        announce_addr: SocketAddr,
        task_addr: SocketAddr,
    ) -> Result<DispatcherHandle, Error> {
        let announce_listener = TcpListener::bind(announce_addr).await?;
        let task_listener = TcpListener::bind(task_addr).await?;
        let bound_announce_addr = announce_listener.local_addr()?;
        let bound_task_addr = task_listener.local_addr()?;

        let this = self.clone();
        executor.native_spawn(async move {
            this.accept_announce_subscribers(announce_listener).await;
        });

        let this = self.clone();
        executor.native_spawn(async move {
            this.accept_task_connections(task_listener).await;
        });

        let this = self.clone();
        let join = executor.native_spawn(async move { this.run_announce_tick().await });

        Ok(DispatcherHandle {
            announce_addr: bound_announce_addr,
            task_addr: bound_task_addr,
            join,
        })
    }

    async fn accept_announce_subscribers(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown_notify.notified() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            log::debug!("announcement subscriber connected: {addr}");
                            self.inner.announce_subscribers.lock().await.push(socket);
                        }
                        Err(e) => log::warn!("announcement listener accept failed: {e}"),
                    }
                }
            }
        }
    }

    async fn run_announce_tick(&self) -> Result<i32, Error> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown_notify.notified() => {
                    self.broadcast(AnnounceMsg::Shutdown).await;
                    return Ok(self.inner.shutdown_exit_code.load(Ordering::Acquire));
                }
                _ = tokio::time::sleep(self.inner.check_interval) => {
                    let queue_depth = self.inner.task_queue.lock().await.len();
                    log::trace!("announce tick: queue_depth={queue_depth}");
                    if queue_depth > 0 && self.inner.announce_gate.due() {
                        self.broadcast(AnnounceMsg::Wake).await;
                        self.inner.announce_gate.mark_sent();
                    }
                }
            }
        }
    }

    async fn broadcast(&self, msg: AnnounceMsg) {
        let mut subscribers = self.inner.announce_subscribers.lock().await;
        let mut dead = Vec::new();
        for (idx, socket) in subscribers.iter_mut().enumerate() {
            if wire::write_frame(socket, &msg).await.is_err() {
                dead.push(idx);
            }
        }
        for idx in dead.into_iter().rev() {
            subscribers.remove(idx);
        }
        log::debug!("broadcast {:?} to {} subscribers", msg, subscribers.len());
    }

    async fn accept_task_connections(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown_notify.notified() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            log::debug!("task connection from {addr}");
                            let this = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.serve_task_connection(socket).await {
                                    log::debug!("task connection {addr} ended: {e}");
                                }
                            });
                        }
                        Err(e) => log::warn!("task listener accept failed: {e}"),
                    }
                }
            }
        }
    }

    async fn serve_task_connection(&self, socket: TcpStream) -> Result<(), Error> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let msg: ClientMsg = match wire::read_frame(&mut reader).await {
                Ok(m) => m,
                Err(_) => return Ok(()),
            };
            self.record_contact();
            match msg {
                ClientMsg::Request(TaskRequestMsg::RequestBatch { max_batch }) => {
                    let tasks = self.pull_batch(max_batch).await;
                    let reply = if tasks.is_empty() {
                        TaskReplyMsg::NoWork
                    } else {
                        TaskReplyMsg::Batch { tasks }
                    };
                    wire::write_frame(&mut write_half, &reply).await?;
                }
                ClientMsg::Results(results) => {
                    // Ack first so the worker may proceed before the results
                    // are actually enqueued (spec.md §4.2).
                    wire::write_frame(&mut write_half, &TaskReplyMsg::Ack).await?;
                    for result in results {
                        self.report_result(result).await;
                    }
                }
            }
        }
    }
}
