use futures::stream::{self, StreamExt};
use std::collections::HashMap;

use crate::document::DocumentId;
use crate::error::ProjectionError;
use crate::event::{EventWithPosition, Position, ProjectionEvent};
use crate::proxy::ProjectorProxy;

/// Split a chunk into per-identity batches, keeping event order within each
/// identity and ordering batches by first appearance.
pub(crate) fn group_by_id<I, E>(
    proxy: &dyn ProjectorProxy<I, E>,
    events: Vec<EventWithPosition<E>>,
) -> Result<Vec<(I, Vec<EventWithPosition<E>>)>, ProjectionError>
where
    I: DocumentId,
    E: ProjectionEvent,
{
    let mut index: HashMap<I, usize> = HashMap::new();
    let mut groups: Vec<(I, Vec<EventWithPosition<E>>)> = Vec::new();

    for event in events {
        let id = proxy.extract_id(&event.event)?;
        match index.get(&id) {
            Some(&slot) => groups[slot].1.push(event),
            None => {
                index.insert(id.clone(), groups.len());
                groups.push((id, vec![event]));
            }
        }
    }
    Ok(groups)
}

/// Submit every identity batch of a chunk, at most `parallelism` at a time.
///
/// Succeeds with the highest acknowledged position only if every batch was
/// acknowledged; otherwise fails with the first rejection.
pub(crate) async fn project_chunk<I, E>(
    proxy: &dyn ProjectorProxy<I, E>,
    events: Vec<EventWithPosition<E>>,
    parallelism: usize,
) -> Result<Option<Position>, ProjectionError>
where
    I: DocumentId,
    E: ProjectionEvent,
{
    let groups = group_by_id(proxy, events)?;
    let responses: Vec<_> = stream::iter(groups)
        .map(|(id, batch)| proxy.submit(id, batch))
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;

    let mut highest = None;
    for response in responses {
        let position = response.into_result()?;
        highest = highest.max(position);
    }
    Ok(highest)
}
