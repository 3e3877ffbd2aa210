//! Subcommand bodies. `master` and `run` both drive the same iteration loop
//! over a `dyn WorkManager`; they differ only in which implementation (network
//! vs. in-process) and whether a dispatch fabric needs to be served.

use std::net::SocketAddr;
use std::path::Path;

use task_executor::Executor;
use wess_archive::Archive;
use wess_model::{EndpointType, Pcoord, Segment, SegmentStatus, SummaryRow};
use wess_workmanager::{DistributedWorkManager, Propagator, PropagatorError, SerialWorkManager, WorkManager};

use crate::cli::Command;
use crate::config::Config;
use crate::error::Error;

/// Stands in for a real simulation backend: advances each segment's
/// progress-coordinate trajectory by replaying its last known point across
/// the remaining frames. This crate has no physics of its own — spec.md
/// leaves the propagator as an external collaborator (§6) — so this exists
/// only to make `wess run`/`wess master` exercise the full archive/dispatch
/// pipeline end to end.
pub struct DemoPropagator;

impl Propagator for DemoPropagator {
    fn propagate(&self, block: &[Segment]) -> Result<Vec<Segment>, PropagatorError> {
        Ok(block
            .iter()
            .cloned()
            .map(|mut seg| {
                let ndim = seg.pcoord.pcoord_ndim;
                let last_row = seg.pcoord.row(seg.pcoord.filled_rows.saturating_sub(1)).to_vec();
                for row in 0..seg.pcoord.pcoord_len {
                    seg.pcoord.values[row * ndim..(row + 1) * ndim].copy_from_slice(&last_row);
                }
                seg.pcoord.filled_rows = seg.pcoord.pcoord_len;
                seg.status = SegmentStatus::Complete;
                seg.cputime = 1.0;
                seg.walltime = 1.0;
                seg
            })
            .collect())
    }
}

fn seed_iteration(n_particles: usize, pcoord_ndim: usize, pcoord_len: usize) -> Vec<Segment> {
    (0..n_particles as u32)
        .map(|seg_id| Segment {
            seg_id,
            n_iter: 1,
            weight: 1.0 / n_particles as f64,
            parent_ids: std::iter::once(0).collect(),
            p_parent_id: 0,
            status: SegmentStatus::Prepared,
            endpoint_type: EndpointType::Unset,
            pcoord: Pcoord::new_unfilled(pcoord_len, pcoord_ndim, &vec![0.0; pcoord_ndim]),
            cputime: 0.0,
            walltime: 0.0,
            data: Default::default(),
        })
        .collect()
}

fn continuation_iteration(n_iter: u32, completed: &[Segment]) -> Vec<Segment> {
    completed
        .iter()
        .map(|parent| {
            let last = parent.pcoord.row(parent.pcoord.filled_rows.saturating_sub(1)).to_vec();
            Segment {
                seg_id: parent.seg_id,
                n_iter,
                weight: parent.weight,
                parent_ids: std::iter::once(parent.seg_id).collect(),
                p_parent_id: parent.seg_id,
                status: SegmentStatus::Prepared,
                endpoint_type: EndpointType::Unset,
                pcoord: Pcoord::new_unfilled(parent.pcoord.pcoord_len, parent.pcoord.pcoord_ndim, &last),
                cputime: 0.0,
                walltime: 0.0,
                data: Default::default(),
            }
        })
        .collect()
}

fn open_archive(path: &Path, config: &Config) -> Result<Archive, Error> {
    let archive = Archive::open(path)?;
    if archive.current_iteration().is_err() {
        archive.prepare(config.pcoord_ndim, config.pcoord_len, config.n_bins)?;
        let seed = seed_iteration(config.workers.max(1), config.pcoord_ndim, config.pcoord_len);
        archive.prepare_iteration(1, &seed)?;
        archive.set_current_iteration(1)?;
    }
    Ok(archive)
}

async fn run_loop(
    archive: &Archive,
    work_manager: &dyn WorkManager,
    blocksize: usize,
    iterations: u32,
) -> Result<(), Error> {
    let mut n_iter = archive.current_iteration()?;
    while n_iter < iterations {
        log::info!("iteration {n_iter}: propagating");
        let segments = archive.get_segments(n_iter)?;
        let propagated = work_manager.propagate(n_iter, &segments, blocksize).await?;
        archive.update_segments(n_iter, &propagated)?;

        let mut summary = SummaryRow::incomplete(n_iter, &propagated);
        summary.status = wess_model::IterationStatus::Complete;
        archive.update_iter_summary(summary)?;

        let next_iter = n_iter + 1;
        let next_segments = continuation_iteration(next_iter, &propagated);
        archive.prepare_iteration(next_iter, &next_segments)?;
        archive.set_current_iteration(next_iter)?;
        n_iter = next_iter;
    }
    log::info!("reached target iteration {iterations}");
    Ok(())
}

async fn with_ctrl_c<F: std::future::Future<Output = Result<(), Error>>>(fut: F) -> Result<(), Error> {
    tokio::select! {
        result = fut => result,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("received ctrl-c, shutting down");
            Err(Error::Interrupted)
        }
    }
}

async fn run_serial(config: Config, archive_path: Option<std::path::PathBuf>, blocksize: Option<usize>, iterations: u32, executor: Executor) -> Result<(), Error> {
    let path = archive_path.unwrap_or(config.archive_path.clone());
    let archive = open_archive(&path, &config)?;
    let manager = SerialWorkManager::new(DemoPropagator, executor);
    with_ctrl_c(run_loop(&archive, &manager, blocksize.unwrap_or(config.blocksize), iterations)).await
}

async fn run_master(
    config: Config,
    host: Option<std::net::IpAddr>,
    announce_port: Option<u16>,
    task_port: Option<u16>,
    archive_path: Option<std::path::PathBuf>,
    blocksize: Option<usize>,
    iterations: u32,
    executor: Executor,
) -> Result<(), Error> {
    let path = archive_path.unwrap_or(config.archive_path.clone());
    let archive = open_archive(&path, &config)?;

    let dispatcher = wess_dispatch::Dispatcher::new(
        config.check_interval,
        config.announce_interval,
        config.abort_interval,
    );
    let announce_addr: SocketAddr = (host.unwrap_or(config.host), announce_port.unwrap_or(config.announce_port)).into();
    let task_addr: SocketAddr = (host.unwrap_or(config.host), task_port.unwrap_or(config.task_port)).into();
    let handle = dispatcher.serve(&executor, announce_addr, task_addr).await?;
    log::info!(
        "master listening: announce={} task={}",
        handle.announce_addr,
        handle.task_addr
    );

    let manager = DistributedWorkManager::new(dispatcher.clone());
    let result = with_ctrl_c(run_loop(&archive, &manager, blocksize.unwrap_or(config.blocksize), iterations)).await;

    let exit_code = if result.is_ok() { 0 } else { 2 };
    dispatcher.shutdown(exit_code);
    handle.wait().await.ok();
    result
}

async fn run_worker(
    config: Config,
    host: Option<std::net::IpAddr>,
    announce_port: Option<u16>,
    task_port: Option<u16>,
    workers: Option<usize>,
    executor: Executor,
) -> Result<(), Error> {
    let announce_addr: SocketAddr = (host.unwrap_or(config.host), announce_port.unwrap_or(config.announce_port)).into();
    let task_addr: SocketAddr = (host.unwrap_or(config.host), task_port.unwrap_or(config.task_port)).into();

    let worker_config = wess_worker::WorkerConfig {
        n_procs: workers.unwrap_or(config.workers).max(1),
        ..wess_worker::WorkerConfig::default()
    };
    let worker = wess_worker::Worker::new(DemoPropagator, executor, worker_config);
    with_ctrl_c(async move { worker.run(announce_addr, task_addr).await.map_err(Error::from) }).await
}

pub async fn dispatch(command: Command, config: Config, executor: Executor) -> Result<(), Error> {
    match command {
        Command::Master {
            host,
            announce_port,
            task_port,
            archive,
            iterations,
            blocksize,
        } => run_master(config, host, announce_port, task_port, archive, blocksize, iterations, executor).await,
        Command::Worker {
            host,
            announce_port,
            task_port,
            workers,
        } => run_worker(config, host, announce_port, task_port, workers, executor).await,
        Command::Run {
            iterations,
            archive,
            blocksize,
        } => run_serial(config, archive, blocksize, iterations, executor).await,
    }
}
