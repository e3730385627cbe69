use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use super::DocumentWorker;
use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, ProjectionEvent};
use crate::response::ProjectResponse;

/// Batches a worker buffers before callers wait for room.
const MAILBOX_CAPACITY: usize = 64;

struct ProjectEvents<E> {
    events: Vec<EventWithPosition<E>>,
    reply: oneshot::Sender<ProjectResponse>,
}

/// The worker no longer accepts batches; carries the batch back to the caller.
pub struct WorkerUnavailable<E>(pub Vec<EventWithPosition<E>>);

impl<E> fmt::Debug for WorkerUnavailable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerUnavailable({} events)", self.0.len())
    }
}

/// Observes when a worker task has finished.
#[derive(Clone)]
pub struct StopWatch(watch::Receiver<bool>);

impl StopWatch {
    pub fn has_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the worker task is gone.
    pub async fn stopped(mut self) {
        // A dropped sender means the task is gone as well.
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }

    /// A watch that reports stopped once both workers have stopped.
    pub fn join(self, other: StopWatch) -> StopWatch {
        let (stop_tx, stop_rx) = watch::channel(false);
        let signal = StopSignal(stop_tx);
        tokio::spawn(async move {
            let _signal = signal;
            self.stopped().await;
            other.stopped().await;
        });
        StopWatch(stop_rx)
    }
}

/// Flags the worker as stopped however its task ends, including abort.
struct StopSignal(watch::Sender<bool>);

impl Drop for StopSignal {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Address of a running document worker.
///
/// Batches sent through one handle are processed in the order they were
/// sent. Dropping every handle lets the worker finish its queue and stop.
pub struct WorkerHandle<E> {
    instance: u64,
    id: String,
    sender: mpsc::Sender<ProjectEvents<E>>,
    stopped: StopWatch,
    abort: AbortHandle,
}

impl<E> Clone for WorkerHandle<E> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance,
            id: self.id.clone(),
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
            abort: self.abort.clone(),
        }
    }
}

impl<E: ProjectionEvent> WorkerHandle<E> {
    /// Spawn the task owning `worker`.
    ///
    /// With `previous`, the new task processes nothing until the previous
    /// worker for the same document has stopped, so two workers never
    /// write the same document concurrently.
    pub fn spawn<I, D>(
        worker: DocumentWorker<I, D, E>,
        instance: u64,
        passivate_after: Option<Duration>,
        previous: Option<StopWatch>,
    ) -> Self
    where
        I: DocumentId,
        D: Document,
    {
        let id = worker.id().to_id_string();
        let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let signal = StopSignal(stop_tx);

        let task = tokio::spawn(run(worker, mailbox, passivate_after, previous, signal));

        Self {
            instance,
            id,
            sender,
            stopped: StopWatch(stop_rx),
            abort: task.abort_handle(),
        }
    }

    /// Queue a batch and wait for its outcome.
    pub async fn project(
        &self,
        events: Vec<EventWithPosition<E>>,
    ) -> Result<ProjectResponse, WorkerUnavailable<E>> {
        let (reply, response) = oneshot::channel();
        if let Err(mpsc::error::SendError(command)) =
            self.sender.send(ProjectEvents { events, reply }).await
        {
            return Err(WorkerUnavailable(command.events));
        }

        Ok(response.await.unwrap_or_else(|_| {
            ProjectResponse::Reject(ProjectionError::WorkerStopped(format!(
                "worker for {} stopped before answering",
                self.id
            )))
        }))
    }
}

impl<E> WorkerHandle<E> {
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker accepts no more batches.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn has_stopped(&self) -> bool {
        self.stopped.has_stopped()
    }

    pub fn stop_watch(&self) -> StopWatch {
        self.stopped.clone()
    }

    /// Kill the task. Queued callers get `WorkerStopped`.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

async fn run<I, D, E>(
    mut worker: DocumentWorker<I, D, E>,
    mut mailbox: mpsc::Receiver<ProjectEvents<E>>,
    passivate_after: Option<Duration>,
    previous: Option<StopWatch>,
    signal: StopSignal,
) where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    let _signal = signal;
    let id = worker.id().to_id_string();

    if let Some(previous) = previous {
        previous.stopped().await;
    }
    tracing::debug!(id = %id, "document worker started");

    loop {
        let next = match passivate_after {
            Some(idle) => match tokio::time::timeout(idle, mailbox.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::debug!(id = %id, "passivating idle document worker");
                    break;
                }
            },
            None => mailbox.recv().await,
        };

        let Some(command) = next else {
            tracing::debug!(id = %id, "document worker released");
            return;
        };

        let response = worker.process(&command.events).await;
        let rejected = !response.is_acknowledged();
        let _ = command.reply.send(response);
        if rejected {
            break;
        }
    }

    // Refuse new batches but answer everything already queued, in order.
    mailbox.close();
    while let Some(command) = mailbox.recv().await {
        let response = worker.process(&command.events).await;
        let _ = command.reply.send(response);
    }
    tracing::debug!(id = %id, "document worker stopped");
}
