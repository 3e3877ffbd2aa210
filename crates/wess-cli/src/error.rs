//! Every crate's error converges here via `#[from]`; `main` maps this to the
//! process exit codes of spec.md §6/§7.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Archive(#[from] wess_archive::Error),
    #[error(transparent)]
    Dispatch(#[from] wess_dispatch::Error),
    #[error(transparent)]
    WorkManager(#[from] wess_workmanager::Error),
    #[error(transparent)]
    Worker(#[from] wess_worker::Error),
    #[error(transparent)]
    Model(#[from] wess_model::ModelError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interrupted")]
    Interrupted,
}

/// 0 clean, 2 interrupted (ctrl-c / dispatcher `NoClients` shutdown), 4
/// internal error — the taxonomy of spec.md §7.
pub fn exit_code(result: &Result<(), Error>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(Error::Interrupted) => 2,
        Err(Error::Dispatch(wess_dispatch::Error::NoClients)) => 2,
        Err(Error::WorkManager(wess_workmanager::Error::Dispatch(wess_dispatch::Error::NoClients))) => 2,
        Err(_) => 4,
    }
}
