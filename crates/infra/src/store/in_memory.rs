use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use haulage_core::{VersionedAggregate, WatermarkField};
use haulage_events::{ChangeEvent, InMemoryChangeHub};

use super::{
    DocumentStore, Filter, Patch, StoreError, decode, encode, matches_all, read_version,
    write_version,
};

/// In-memory document store that publishes every committed write to a change hub.
///
/// Intended for tests/dev. Publishing happens under the write lock, so the hub
/// sees changes in commit order.
#[derive(Debug)]
pub struct InMemoryDocumentStore<A: VersionedAggregate> {
    docs: RwLock<BTreeMap<Uuid, Value>>,
    hub: Arc<InMemoryChangeHub<A>>,
}

impl<A: VersionedAggregate> InMemoryDocumentStore<A> {
    pub fn new(hub: Arc<InMemoryChangeHub<A>>) -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            hub,
        }
    }

    /// Store plus a fresh hub of its own.
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(InMemoryChangeHub::new())))
    }

    pub fn hub(&self) -> &Arc<InMemoryChangeHub<A>> {
        &self.hub
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("lock poisoned".to_string())
    }

    fn insert_locked(
        &self,
        docs: &mut BTreeMap<Uuid, Value>,
        mut doc: A,
    ) -> Result<A, StoreError> {
        let id: Uuid = doc.id().into();
        if docs.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                collection: A::COLLECTION,
                id,
            });
        }

        doc.set_version(1);
        docs.insert(id, encode(&doc)?);

        self.hub
            .publish(&ChangeEvent::Insert {
                document_id: doc.id(),
                version: 1,
                after: doc.clone(),
            })
            .map_err(|e| StoreError::Publish(e.to_string()))?;

        Ok(doc)
    }

    /// Conditional patch of one stored document. `Ok(None)` = filters failed.
    fn update_locked(
        &self,
        id: Uuid,
        stored: &mut Value,
        filters: &[Filter],
        patch: &Patch,
    ) -> Result<Option<A>, StoreError> {
        if !matches_all(filters, stored) {
            return Ok(None);
        }

        let mut next = stored.clone();
        let changed = patch.apply(&mut next)?;
        if changed.is_empty() {
            return decode(next).map(Some);
        }

        let version = read_version(stored) + 1;
        write_version(&mut next, version);

        // Decode both sides before committing so a badly typed patch never lands.
        let before: A = decode(stored.clone())?;
        let after: A = decode(next.clone())?;
        *stored = next;

        self.hub
            .publish(&ChangeEvent::Update {
                document_id: id.into(),
                version,
                changed_fields: changed,
                before: Some(before),
                after: Some(after.clone()),
            })
            .map_err(|e| StoreError::Publish(e.to_string()))?;

        Ok(Some(after))
    }
}

#[async_trait]
impl<A: VersionedAggregate> DocumentStore<A> for InMemoryDocumentStore<A> {
    async fn get(&self, id: A::Id) -> Result<Option<A>, StoreError> {
        let uuid: Uuid = id.into();
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        docs.get(&uuid).cloned().map(decode).transpose()
    }

    async fn insert(&self, doc: A) -> Result<A, StoreError> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        self.insert_locked(&mut docs, doc)
    }

    async fn insert_unless(&self, doc: A, unless: &[Filter]) -> Result<Option<A>, StoreError> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        if docs.values().any(|d| matches_all(unless, d)) {
            return Ok(None);
        }
        self.insert_locked(&mut docs, doc).map(Some)
    }

    async fn claim(
        &self,
        id: A::Id,
        field: WatermarkField,
        version: u64,
    ) -> Result<Option<A>, StoreError> {
        let uuid: Uuid = id.into();
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        let Some(stored) = docs.get_mut(&uuid) else {
            return Ok(None);
        };

        let mut doc: A = decode(stored.clone())?;
        if !doc.watermarks_mut().try_advance(field, version) {
            return Ok(None);
        }
        *stored = encode(&doc)?;
        Ok(Some(doc))
    }

    async fn update_where(
        &self,
        id: A::Id,
        filters: &[Filter],
        patch: Patch,
    ) -> Result<Option<A>, StoreError> {
        patch.validate()?;
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        let uuid: Uuid = id.into();
        match docs.get_mut(&uuid) {
            Some(stored) => self.update_locked(uuid, stored, filters, &patch),
            None => Ok(None),
        }
    }

    async fn update_many_where(
        &self,
        filters: &[Filter],
        patch: Patch,
    ) -> Result<Vec<A>, StoreError> {
        patch.validate()?;
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;

        let mut updated = Vec::new();
        for (id, stored) in docs.iter_mut() {
            let before_version = read_version(stored);
            if let Some(doc) = self.update_locked(*id, stored, filters, &patch)? {
                if doc.version() != before_version {
                    updated.push(doc);
                }
            }
        }
        Ok(updated)
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<A>, StoreError> {
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        docs.values()
            .filter(|d| matches_all(filters, d))
            .cloned()
            .map(decode)
            .collect()
    }
}
