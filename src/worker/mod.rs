//! Document workers - One task per document identity.
//!
//! A [`DocumentWorker`] is the state machine (`Unloaded` / `Loaded`) that
//! folds a batch through the handler table and persists the result. A
//! [`WorkerHandle`] is the address of the tokio task that owns it: batches
//! are queued on an ordered channel, so a document never sees two batches
//! at once and results come back in submission order.
//!
//! ## Example
//!
//! ```ignore
//! let worker = DocumentWorker::new("orders".into(), order_id, handlers, storage, 5);
//! let handle = WorkerHandle::spawn(worker, 1, Some(Duration::from_secs(60)), None);
//!
//! match handle.project(events).await {
//!     Ok(ProjectResponse::Acknowledge(position)) => { /* advance cursor */ }
//!     Ok(ProjectResponse::Reject(error)) => { /* batch failed */ }
//!     Err(WorkerUnavailable(events)) => { /* worker stopped, spawn a new one */ }
//! }
//! ```

mod document_worker;
mod handle;

pub use document_worker::{DocumentWorker, WorkerState};
pub use handle::{StopWatch, WorkerHandle, WorkerUnavailable};
