//! Stream driver - Feeding a projection from its event source.
//!
//! The driver reads the projection's stored position, pulls events after it,
//! groups them into size/time windowed chunks and splits each chunk into one
//! batch per document identity. Batches of one chunk run concurrently; the
//! next chunk starts only after every batch of the previous one was
//! acknowledged, so per-identity order holds across chunks. The stored
//! position then moves to the highest acknowledged position, never back.
//!
//! A failed continuous stream is resubscribed from the stored position after
//! an exponential backoff, until more than `max_restarts` restarts happen
//! inside the restart window.
//!
//! ## Example
//!
//! ```ignore
//! let driver = StreamDriver::new("orders", source, proxy, positions)
//!     .with_stream(ProjectionStreamConfiguration::new().with_batch_size(50))
//!     .with_restart_settings(RestartSettings::new().with_max_restarts(3, Duration::from_secs(60)));
//!
//! driver.run().await?;
//! ```

mod driver;
mod restart;
mod source;
mod submit;

pub use driver::{ProjectionMode, StreamDriver};
pub use restart::RestartBackoff;
pub use source::{EventSource, InMemoryEventSource};
