use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use marketpay_core::{AggregateId, ExpectedVersion, TenantId};

use super::store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

type StreamKey = (TenantId, AggregateId);

/// In-memory append-only event store for tests and single-process runs.
///
/// One vector per (tenant, aggregate) stream behind one RwLock; the write
/// lock is held across version check and append, which is what makes a
/// batch atomic and sequence numbers gap-free.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_streams(&self) -> RwLockReadGuard<'_, HashMap<StreamKey, Vec<StoredEvent>>> {
        match self.streams.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_streams(&self) -> RwLockWriteGuard<'_, HashMap<StreamKey, Vec<StoredEvent>>> {
        match self.streams.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Check that a batch targets exactly one stream and return its identity.
fn batch_stream(events: &[UncommittedEvent]) -> Result<(StreamKey, &str), EventStoreError> {
    let head = &events[0];
    for event in &events[1..] {
        if event.tenant_id != head.tenant_id {
            return Err(EventStoreError::TenantIsolation(
                "append batch spans multiple tenants".to_string(),
            ));
        }
        if event.aggregate_id != head.aggregate_id {
            return Err(EventStoreError::InvalidAppend(
                "append batch spans multiple aggregates".to_string(),
            ));
        }
        if event.aggregate_type != head.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(
                "append batch mixes aggregate types".to_string(),
            ));
        }
    }
    Ok(((head.tenant_id, head.aggregate_id), &head.aggregate_type))
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let (key, aggregate_type) = batch_stream(&events)?;
        let aggregate_type = aggregate_type.to_string();

        let mut streams = self.write_streams();
        let stream = streams.entry(key).or_default();

        let current = stream.last().map(|e| e.sequence_number).unwrap_or(0);
        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, stream is at {current}"
            )));
        }
        if let Some(first) = stream.first() {
            if first.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream holds '{}' events, refusing '{}'",
                    first.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(event, sequence_number)| StoredEvent {
                event_id: event.event_id,
                tenant_id: event.tenant_id,
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                sequence_number,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            })
            .collect();
        stream.extend(committed.iter().cloned());

        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        Ok(self
            .read_streams()
            .get(&(tenant_id, aggregate_id))
            .cloned()
            .unwrap_or_default())
    }
}
