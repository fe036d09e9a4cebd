//! Watermark compare-and-set claims.

use tracing::debug;

use haulage_core::{VersionedAggregate, WatermarkField};

use crate::store::{SharedStore, StoreError};

/// Grants at most one handler per (document, concern, version) the right to
/// reconcile.
///
/// A claim is a single atomic conditional update on the document's watermark.
/// Losing a claim is normal (replay, concurrent duplicate delivery, newer event
/// already handled) and is reported as `Ok(None)`.
pub struct VersionGate<A: VersionedAggregate> {
    store: SharedStore<A>,
    field: WatermarkField,
}

impl<A: VersionedAggregate> Clone for VersionGate<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            field: self.field,
        }
    }
}

impl<A: VersionedAggregate> VersionGate<A> {
    pub fn new(store: SharedStore<A>, field: WatermarkField) -> Self {
        Self { store, field }
    }

    pub fn field(&self) -> WatermarkField {
        self.field
    }

    /// Claim `id` for `event_version`; returns the current document on success.
    pub async fn claim(&self, id: A::Id, event_version: u64) -> Result<Option<A>, StoreError> {
        let claimed = self.store.claim(id, self.field, event_version).await?;
        if claimed.is_none() {
            debug!(
                collection = A::COLLECTION,
                document_id = %id,
                watermark = %self.field,
                version = event_version,
                "claim lost"
            );
        }
        Ok(claimed)
    }
}
