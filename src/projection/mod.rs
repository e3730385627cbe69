//! Projections runtime - Named projections, their configuration and lifecycle.
//!
//! A projection is a name, a handler table and an event source. Its
//! [`ProjectionConfiguration`] adds storage, position storage, stream and
//! restart settings, storage batching and a distribution strategy, and
//! validates them on `build()`. The [`ProjectionsCoordinator`] runs one
//! stream driver per registered projection and hands out
//! [`ProjectionHandle`]s to observe or stop them.
//!
//! ## Example
//!
//! ```ignore
//! use sourced_projections::{ProjectionConfiguration, ProjectionsCoordinator};
//!
//! let projection = ProjectionConfiguration::new("order_views", handlers, source)
//!     .with_storage(storage.clone())
//!     .build()?;
//!
//! let mut coordinator = ProjectionsCoordinator::new();
//! coordinator.register(projection)?;
//! coordinator.start();
//!
//! coordinator.get_projection("order_views")?.wait_for_completion(None).await?;
//! ```

mod configuration;
mod coordinator;
mod handle;

pub use configuration::{Projection, ProjectionConfiguration, RunProjection};
pub use coordinator::ProjectionsCoordinator;
pub use handle::{ProjectionHandle, ProjectionStatus};
