//! The master-side dispatch fabric (spec.md §4, C3+C4): a pub/sub
//! announcement channel workers subscribe to, and a request/reply task
//! channel they poll. Grounded on `nailgun::server`'s accept-loop/graceful-
//! shutdown idiom and `process_execution::bounded`'s `Notify`-gated queue.

mod dispatcher;
pub mod wire;

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use wire::{AnnounceMsg, ClientMsg, TaskEnvelope, TaskReplyMsg, TaskRequestMsg, WorkerResultMsg};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode/decode a wire message: {0}")]
    Codec(#[from] bincode::Error),
    #[error("abort_interval elapsed with no worker contact")]
    NoClients,
    #[error("internal dispatcher error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests;
