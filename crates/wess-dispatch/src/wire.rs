//! The wire format shared by the announcement and task channels: a 4-byte
//! big-endian length prefix followed by a `bincode`-encoded message. Grounded
//! on `nailgun`'s posture of picking one concrete framing and documenting it,
//! rather than pulling in a general RPC framework.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wess_model::Segment;

use crate::Error;

/// Anything the dispatcher pushes to subscribers of the announcement channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnnounceMsg {
    /// There is work on the task queue; workers should poll the task channel.
    Wake,
    /// The run is shutting down; workers should stop polling.
    Shutdown,
}

/// A unit of work handed to exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: u64,
    pub n_iter: u32,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskRequestMsg {
    RequestBatch { max_batch: usize },
}

/// Everything a worker sends on the task channel: either a pull for fresh
/// work, or a report on work already handed out. Folding both into one enum
/// keeps the connection a simple read-loop instead of needing a side channel
/// to tell requests and reports apart. A worker posts its whole batch of
/// results as a single `Results` message (spec.md §4.2's `{kind: "results",
/// list}`), not one message per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMsg {
    Request(TaskRequestMsg),
    Results(Vec<WorkerResultMsg>),
}

/// Every request gets exactly one reply (spec.md §4.2): a task batch or
/// empty list for `Request`, a bare `Ack` for `Results` so the worker may
/// proceed before the dispatcher has even enqueued the results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskReplyMsg {
    Batch { tasks: Vec<TaskEnvelope> },
    NoWork,
    Ack,
}

/// What a worker reports back about one task, per Open Question (b): a
/// worker returning fewer segments than it was given surfaces the shortfall
/// as an exception naming the missing seg_ids, rather than silently dropping
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerResultMsg {
    Completed {
        task_id: u64,
        segments: Vec<Segment>,
    },
    Exception {
        task_id: u64,
        failed_seg_ids: Vec<u32>,
        message: String,
    },
}

const MAX_FRAME_BYTES: u32 = 512 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    msg: &T,
) -> Result<(), Error> {
    let bytes = bincode::serialize(msg)?;
    let len = u32::try_from(bytes.len()).map_err(|_| Error::Transport("frame too large".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> Result<T, Error> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Transport(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_through_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = TaskRequestMsg::RequestBatch { max_batch: 7 };
        write_frame(&mut a, &msg).await.unwrap();
        let got: TaskRequestMsg = read_frame(&mut b).await.unwrap();
        match got {
            TaskRequestMsg::RequestBatch { max_batch } => assert_eq!(max_batch, 7),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocating() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&(MAX_FRAME_BYTES + 1).to_be_bytes()).await.unwrap();
        let err = read_frame::<_, TaskRequestMsg>(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
