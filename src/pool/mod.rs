//! Projector pool - Resident document workers of one projection on one node.
//!
//! The pool creates workers lazily, counts in-flight batches per identity and
//! evicts the least recently used idle worker once more than `max_resident`
//! are alive. A worker with batches in flight is never torn down: it is
//! marked and removed when its last batch settles. A replacement worker for
//! the same identity waits until its predecessor has stopped.
//!
//! The entry table sits behind a `std::sync::Mutex` that is only held for
//! bookkeeping, never across an await.
//!
//! ## Example
//!
//! ```ignore
//! let pool = ProjectorPool::new("orders", handlers, storage, &stream, passivation);
//! let response = pool.submit(order_id, events).await;
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use crate::config::{PassivationSettings, ProjectionStreamConfiguration};
use crate::document::{Document, DocumentId};
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, ProjectionEvent};
use crate::handlers::ProjectionHandlers;
use crate::response::ProjectResponse;
use crate::storage::ProjectionStorage;
use crate::worker::{DocumentWorker, StopWatch, WorkerHandle, WorkerUnavailable};

struct PoolEntry<E> {
    worker: WorkerHandle<E>,
    in_flight: usize,
    last_touched: u64,
    marked_for_removal: bool,
}

impl<E> PoolEntry<E> {
    fn new(worker: WorkerHandle<E>, now: u64) -> Self {
        Self {
            worker,
            in_flight: 0,
            last_touched: now,
            marked_for_removal: false,
        }
    }
}

struct PoolState<I, E> {
    entries: HashMap<I, PoolEntry<E>>,
    /// Workers torn down by the pool that may still be finishing their queue.
    draining: HashMap<I, StopWatch>,
    clock: u64,
    next_instance: u64,
}

struct PoolInner<I, D, E> {
    projection: Arc<str>,
    handlers: ProjectionHandlers<I, D, E>,
    storage: Arc<dyn ProjectionStorage>,
    max_retries: u32,
    timeout: Duration,
    passivation: PassivationSettings,
    state: Mutex<PoolState<I, E>>,
}

/// Identity to worker mapping for one projection.
///
/// Cloning shares the pool.
pub struct ProjectorPool<I, D, E> {
    inner: Arc<PoolInner<I, D, E>>,
}

impl<I, D, E> Clone for ProjectorPool<I, D, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, D, E> ProjectorPool<I, D, E>
where
    I: DocumentId,
    D: Document,
    E: ProjectionEvent,
{
    pub fn new(
        projection: impl Into<String>,
        handlers: ProjectionHandlers<I, D, E>,
        storage: Arc<dyn ProjectionStorage>,
        stream: &ProjectionStreamConfiguration,
        passivation: PassivationSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                projection: Arc::from(projection.into()),
                handlers,
                storage,
                max_retries: stream.max_projection_retries,
                timeout: stream.project_document_timeout,
                passivation,
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    draining: HashMap::new(),
                    clock: 0,
                    next_instance: 1,
                }),
            }),
        }
    }

    pub fn projection(&self) -> &str {
        &self.inner.projection
    }

    pub fn handlers(&self) -> &ProjectionHandlers<I, D, E> {
        &self.inner.handlers
    }

    /// The worker for an identity, created if needed.
    pub fn get(&self, id: &I) -> Result<WorkerHandle<E>, ProjectionError> {
        let mut state = self.state()?;
        let entry = self.resolve(&mut state, id);
        let worker = entry.worker.clone();
        self.enforce_capacity(&mut state);
        Ok(worker)
    }

    /// Apply a batch to the document `id` under the per-batch timeout.
    ///
    /// The timeout covers waiting behind earlier batches of the same
    /// identity. A timed-out worker is killed; its document is rebuilt
    /// from storage by the next batch.
    pub async fn submit(&self, id: I, events: Vec<EventWithPosition<E>>) -> ProjectResponse {
        match self.checkout(&id) {
            Ok(worker) => self.project_on(id, worker, events).await,
            Err(error) => ProjectResponse::Reject(error),
        }
    }

    /// Run a batch on a worker taken with [`checkout`](Self::checkout).
    pub(crate) async fn project_on(
        &self,
        id: I,
        worker: WorkerHandle<E>,
        events: Vec<EventWithPosition<E>>,
    ) -> ProjectResponse {
        let deadline = Instant::now() + self.inner.timeout;
        let mut worker = worker;
        let mut events = events;

        loop {
            match timeout_at(deadline, worker.project(events)).await {
                Ok(Ok(response)) => {
                    self.settle(&id, worker.instance(), false);
                    return response;
                }
                Ok(Err(WorkerUnavailable(returned))) => {
                    // Passivated or failed between checkout and send.
                    self.settle(&id, worker.instance(), false);
                    events = returned;
                    worker = match self.checkout(&id) {
                        Ok(worker) => worker,
                        Err(error) => return ProjectResponse::Reject(error),
                    };
                }
                Err(_) => {
                    worker.abort();
                    self.settle(&id, worker.instance(), true);
                    tracing::warn!(
                        projection = %self.inner.projection,
                        id = %worker.id(),
                        "document batch timed out after {:?}",
                        self.inner.timeout
                    );
                    return ProjectResponse::Reject(ProjectionError::Timeout {
                        target: format!("{}/{}", self.inner.projection, worker.id()),
                        after: self.inner.timeout,
                    });
                }
            }
        }
    }

    /// Drop every worker whose identity matches `release`, busy or not.
    ///
    /// Batches already queued still finish on the released workers. The
    /// returned watches tell when each of them is gone; [`adopt`](Self::adopt)
    /// hands them to the pool that serves those identities next.
    pub fn release_where(&self, release: impl Fn(&I) -> bool) -> Vec<(I, StopWatch)> {
        let Ok(mut state) = self.state() else {
            return Vec::new();
        };

        let ids: Vec<I> = state
            .entries
            .keys()
            .chain(state.draining.keys())
            .filter(|id| release(id))
            .cloned()
            .collect();

        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = state.entries.remove(&id) {
                tracing::debug!(
                    projection = %self.inner.projection,
                    id = ?id,
                    instance = entry.worker.instance(),
                    in_flight = entry.in_flight,
                    "releasing document worker"
                );
                released.push((id.clone(), entry.worker.stop_watch()));
            }
            if let Some(watch) = state.draining.remove(&id) {
                released.push((id, watch));
            }
        }
        released.retain(|(_, watch)| !watch.has_stopped());
        released
    }

    /// The next worker created for `id` waits until `predecessor` has stopped.
    pub fn adopt(&self, id: I, predecessor: StopWatch) {
        if predecessor.has_stopped() {
            return;
        }
        let Ok(mut state) = self.state() else {
            return;
        };
        let watch = match state.draining.remove(&id) {
            Some(earlier) if !earlier.has_stopped() => earlier.join(predecessor),
            _ => predecessor,
        };
        state.draining.insert(id, watch);
    }

    /// Whether a live worker is held for `id`.
    pub fn is_resident(&self, id: &I) -> bool {
        self.state()
            .map(|state| {
                state
                    .entries
                    .get(id)
                    .map(|entry| !entry.worker.has_stopped())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Number of live, unmarked workers.
    pub fn resident_count(&self) -> usize {
        self.state()
            .map(|state| {
                state
                    .entries
                    .values()
                    .filter(|entry| !entry.marked_for_removal && !entry.worker.has_stopped())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Identities with an entry in the table, live or not yet pruned.
    pub fn tracked_count(&self) -> usize {
        self.state().map(|state| state.entries.len()).unwrap_or(0)
    }

    /// Instance number of the current worker for `id`; changes whenever the
    /// worker is recreated.
    pub fn worker_instance(&self, id: &I) -> Option<u64> {
        self.state()
            .ok()
            .and_then(|state| state.entries.get(id).map(|entry| entry.worker.instance()))
    }

    fn state(&self) -> Result<MutexGuard<'_, PoolState<I, E>>, ProjectionError> {
        self.inner
            .state
            .lock()
            .map_err(|_| ProjectionError::LockPoisoned("projector pool".into()))
    }

    /// Reserve the worker for `id`; every checkout is matched by a `settle`.
    pub(crate) fn checkout(&self, id: &I) -> Result<WorkerHandle<E>, ProjectionError> {
        let mut state = self.state()?;
        let entry = self.resolve(&mut state, id);
        entry.in_flight += 1;
        let worker = entry.worker.clone();
        self.enforce_capacity(&mut state);
        Ok(worker)
    }

    /// Touch the entry for `id`, replacing a worker that stopped accepting batches.
    fn resolve<'a>(&self, state: &'a mut PoolState<I, E>, id: &I) -> &'a mut PoolEntry<E> {
        state.clock += 1;
        let now = state.clock;

        let entry = match state.entries.entry(id.clone()) {
            Entry::Occupied(occupied) if !occupied.get().worker.is_closed() => occupied.into_mut(),
            Entry::Occupied(mut occupied) => {
                let previous = Some(occupied.get().worker.stop_watch());
                let worker = self.spawn_worker(id, &mut state.next_instance, previous);
                occupied.insert(PoolEntry::new(worker, now));
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => {
                let previous = state.draining.remove(id);
                let worker = self.spawn_worker(id, &mut state.next_instance, previous);
                vacant.insert(PoolEntry::new(worker, now))
            }
        };

        entry.last_touched = now;
        entry.marked_for_removal = false;
        entry
    }

    fn spawn_worker(
        &self,
        id: &I,
        next_instance: &mut u64,
        previous: Option<StopWatch>,
    ) -> WorkerHandle<E> {
        let instance = *next_instance;
        *next_instance += 1;
        let previous = previous.filter(|previous| !previous.has_stopped());

        tracing::debug!(
            projection = %self.inner.projection,
            id = ?id,
            instance,
            waits_for_previous = previous.is_some(),
            "creating document worker"
        );

        let worker = DocumentWorker::new(
            Arc::clone(&self.inner.projection),
            id.clone(),
            self.inner.handlers.clone(),
            Arc::clone(&self.inner.storage),
            self.inner.max_retries,
        );
        let handle = WorkerHandle::spawn(
            worker,
            instance,
            self.inner.passivation.passivate_after,
            previous,
        );
        self.forget_when_stopped(id.clone(), &handle);
        handle
    }

    /// Drop the entry of a worker that stops on its own while idle.
    fn forget_when_stopped(&self, id: I, worker: &WorkerHandle<E>) {
        let pool = Arc::downgrade(&self.inner);
        let instance = worker.instance();
        let stopped = worker.stop_watch();

        tokio::spawn(async move {
            stopped.stopped().await;
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            let idle = matches!(
                state.entries.get(&id),
                Some(entry) if entry.worker.instance() == instance && entry.in_flight == 0
            );
            if idle {
                state.entries.remove(&id);
            }
        });
    }

    fn settle(&self, id: &I, instance: u64, timed_out: bool) {
        let Ok(mut state) = self.state() else {
            return;
        };

        let teardown = match state.entries.get_mut(id) {
            Some(entry) if entry.worker.instance() == instance => {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                timed_out || (entry.marked_for_removal && entry.in_flight == 0)
            }
            _ => false,
        };

        if teardown {
            if let Some(entry) = state.entries.remove(id) {
                tracing::debug!(
                    projection = %self.inner.projection,
                    id = ?id,
                    instance,
                    "tearing down document worker"
                );
                state.draining.insert(id.clone(), entry.worker.stop_watch());
            }
        }

        self.enforce_capacity(&mut state);
    }

    fn enforce_capacity(&self, state: &mut PoolState<I, E>) {
        state.draining.retain(|_, watch| !watch.has_stopped());
        // Workers that passivated themselves no longer count.
        state
            .entries
            .retain(|_, entry| entry.in_flight > 0 || !entry.worker.has_stopped());

        let Some(capacity) = self.inner.passivation.capacity() else {
            return;
        };

        loop {
            let live = state
                .entries
                .values()
                .filter(|entry| !entry.marked_for_removal)
                .count();
            if live <= capacity {
                return;
            }

            let idle = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.in_flight == 0)
                .min_by_key(|(_, entry)| entry.last_touched)
                .map(|(id, _)| id.clone());

            if let Some(victim) = idle {
                if let Some(entry) = state.entries.remove(&victim) {
                    tracing::debug!(
                        projection = %self.inner.projection,
                        id = ?victim,
                        instance = entry.worker.instance(),
                        "evicting document worker"
                    );
                    state.draining.insert(victim, entry.worker.stop_watch());
                }
                continue;
            }

            let busy = state
                .entries
                .iter_mut()
                .filter(|(_, entry)| !entry.marked_for_removal)
                .min_by_key(|(_, entry)| entry.last_touched);

            match busy {
                Some((victim, entry)) => {
                    tracing::debug!(
                        projection = %self.inner.projection,
                        id = ?victim,
                        in_flight = entry.in_flight,
                        "deferring eviction of busy document worker"
                    );
                    entry.marked_for_removal = true;
                }
                None => return,
            }
        }
    }
}
