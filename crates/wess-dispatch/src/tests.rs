use std::net::SocketAddr;
use std::time::Duration;

use task_executor::Executor;
use tokio::net::TcpStream;

use crate::wire::{self, AnnounceMsg, ClientMsg, TaskEnvelope, TaskReplyMsg, TaskRequestMsg, WorkerResultMsg};
use crate::{Dispatcher, Error};

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn envelope(task_id: u64) -> TaskEnvelope {
    TaskEnvelope {
        task_id,
        n_iter: 1,
        segments: Vec::new(),
    }
}

#[tokio::test]
async fn a_pulled_batch_is_removed_from_the_queue_exactly_once() {
    let dispatcher = Dispatcher::new(
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_secs(60),
    );
    dispatcher.enqueue(vec![envelope(0), envelope(1), envelope(2)]).await;

    let first = dispatcher.pull_batch(2).await;
    assert_eq!(first.len(), 2);
    let second = dispatcher.pull_batch(2).await;
    assert_eq!(second.len(), 1);
    let third = dispatcher.pull_batch(2).await;
    assert!(third.is_empty());
}

#[tokio::test]
async fn recv_result_returns_no_clients_once_abort_interval_elapses() {
    let dispatcher = Dispatcher::new(
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(20),
    );
    let err = dispatcher.recv_result().await.unwrap_err();
    assert!(matches!(err, Error::NoClients));
}

#[tokio::test]
async fn recv_result_unblocks_as_soon_as_a_result_is_pushed() {
    let dispatcher = Dispatcher::new(
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_secs(60),
    );
    let pushed = dispatcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        pushed
            .report_result(WorkerResultMsg::Completed {
                task_id: 0,
                segments: Vec::new(),
            })
            .await;
    });

    let result = tokio::time::timeout(Duration::from_secs(1), dispatcher.recv_result())
        .await
        .expect("should not time out")
        .unwrap();
    assert!(matches!(
        result,
        WorkerResultMsg::Completed { task_id: 0, .. }
    ));
}

#[tokio::test]
async fn end_to_end_request_reply_and_announcement_over_real_sockets() {
    let executor = Executor::new();
    let dispatcher = Dispatcher::new(
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_secs(60),
    );
    let handle = dispatcher
        .serve(&executor, loopback(0), loopback(0))
        .await
        .unwrap();

    let mut announce_sock = TcpStream::connect(handle.announce_addr).await.unwrap();
    let mut task_sock = TcpStream::connect(handle.task_addr).await.unwrap();

    dispatcher.enqueue(vec![envelope(42)]).await;

    let announce: AnnounceMsg = wire::read_frame(&mut announce_sock).await.unwrap();
    assert!(matches!(announce, AnnounceMsg::Wake));

    wire::write_frame(
        &mut task_sock,
        &ClientMsg::Request(TaskRequestMsg::RequestBatch { max_batch: 10 }),
    )
    .await
    .unwrap();
    let reply: TaskReplyMsg = wire::read_frame(&mut task_sock).await.unwrap();
    let tasks = match reply {
        TaskReplyMsg::Batch { tasks } => tasks,
        other => panic!("expected a batch, got {other:?}"),
    };
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, 42);

    wire::write_frame(
        &mut task_sock,
        &ClientMsg::Results(vec![WorkerResultMsg::Completed {
            task_id: 42,
            segments: Vec::new(),
        }]),
    )
    .await
    .unwrap();
    let ack: TaskReplyMsg = wire::read_frame(&mut task_sock).await.unwrap();
    assert!(matches!(ack, TaskReplyMsg::Ack));

    let result = dispatcher.recv_result().await.unwrap();
    assert!(matches!(
        result,
        WorkerResultMsg::Completed { task_id: 42, .. }
    ));

    dispatcher.shutdown(0);
    let exit_code = handle.wait().await.unwrap();
    assert_eq!(exit_code, 0);
}
