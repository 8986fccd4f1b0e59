//! Per-client write pump
//!
//! Outbound frames go through a bounded FIFO queue drained by one worker
//! task that owns the socket write half. Writes carry a per-write deadline
//! so one stalled peer can delay a fan-out only up to that bound. A full
//! queue suspends the producer; that back-pressure throttles a fast sender
//! to the slowest receiver in its channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tracing::{debug, error, trace};

use crate::client::Client;
use crate::error::RelayError;

/// Capacity of the per-client outbound queue.
pub const WRITE_QUEUE_SIZE: usize = 1024;

/// Deadline applied to each socket write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(4);

/// Handle to a client's write pump.
///
/// Closing is single-shot: the queue sender is taken (signalling
/// end-of-stream to the worker) and the worker's completion is awaited.
/// Enqueueing after close fails immediately with `ClosedConnection`; so
/// does a send that races a concurrent close.
pub struct ClientWriter {
    queue: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
    closed: AtomicBool,
}

impl ClientWriter {
    pub(crate) fn new(queue: mpsc::Sender<Vec<u8>>, done: oneshot::Receiver<()>) -> Self {
        Self {
            queue: Mutex::new(Some(queue)),
            done: Mutex::new(Some(done)),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a line for delivery. Suspends while the queue is full.
    pub(crate) async fn enqueue(&self, line: Vec<u8>) -> Result<(), RelayError> {
        let sender = match self.queue.lock().await.as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(RelayError::ClosedConnection),
        };
        sender
            .send(line)
            .await
            .map_err(|_| RelayError::ClosedConnection)
    }

    /// Close the pump: stop accepting lines and wait for the worker to exit.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.lock().await.take();
        if let Some(done) = self.done.lock().await.take() {
            let _ = done.await;
        }
    }
}

/// Worker task: drain the queue into the socket write half.
///
/// Exits when the queue closes (draining what remains) or a write fails or
/// misses its deadline. On exit it fails any producer still blocked on the
/// queue, signals completion, then runs the client's close, so the registry
/// removal happens before the socket is shut down at the end. The
/// single-shot latches on client and pump absorb the resulting recursion.
pub(crate) async fn run<S>(
    client: Arc<Client>,
    mut sink: WriteHalf<S>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    done: oneshot::Sender<()>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!(client = %client.label(), "write pump started");
    while let Some(line) = queue.recv().await {
        trace!(
            client = %client.label(),
            payload = %String::from_utf8_lossy(&line),
            "sending line"
        );
        let start = Instant::now();
        let result = time::timeout(WRITE_DEADLINE, async {
            sink.write_all(&line).await?;
            sink.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => client.store_write_duration(start.elapsed()),
            Ok(Err(err)) => {
                if !client.is_closed() {
                    error!(client = %client.label(), %err, "write error");
                }
                break;
            }
            Err(_) => {
                if !client.is_closed() {
                    error!(client = %client.label(), "write deadline exceeded");
                }
                break;
            }
        }
    }
    // Producers blocked on a full queue may hold the registry read lock;
    // fail them before the close below takes the write lock.
    queue.close();
    while queue.try_recv().is_ok() {}
    let _ = done.send(());
    client.close().await;
    let _ = sink.shutdown().await;
    debug!(client = %client.label(), "write pump stopped");
}
