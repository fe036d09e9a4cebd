//! Document store boundary.
//!
//! Aggregates live as JSON documents. Every business mutation is a conditional
//! update (filters on the current document + a top-level patch), bumps the
//! aggregate `version` and produces exactly one change event. Watermark claims
//! are the one exception: they are bookkeeping, so they neither bump the version
//! nor emit events.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use haulage_core::aggregate::{VERSION_FIELD, WATERMARKS_FIELD};
use haulage_core::{VersionedAggregate, WatermarkField};

pub use in_memory::InMemoryDocumentStore;
pub use postgres::{PgChangeFeed, PostgresDocumentStore};

/// Store operation error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("document already exists: {collection}/{id}")]
    AlreadyExists { collection: &'static str, id: Uuid },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("failed to decode document: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to publish change: {0}")]
    Publish(String),
}

/// Condition on a top-level document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the value. `Value::Null` also matches a missing field.
    Eq(&'static str, Value),
    /// Field holds an RFC 3339 timestamp strictly earlier than the cutoff.
    Before(&'static str, DateTime<Utc>),
}

impl Filter {
    pub fn eq(field: &'static str, value: impl Serialize) -> Self {
        Filter::Eq(field, serde_json::to_value(value).unwrap_or(Value::Null))
    }

    pub fn before(field: &'static str, cutoff: DateTime<Utc>) -> Self {
        Filter::Before(field, cutoff)
    }

    pub fn field(&self) -> &'static str {
        match self {
            Filter::Eq(f, _) | Filter::Before(f, _) => f,
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Eq(field, expected) => match doc.get(*field) {
                Some(actual) => actual == expected,
                None => expected.is_null(),
            },
            Filter::Before(field, cutoff) => doc
                .get(*field)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .is_some_and(|t| t < *cutoff),
        }
    }
}

pub fn matches_all(filters: &[Filter], doc: &Value) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

/// Top-level field assignments applied by a conditional update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Serialize) -> Self {
        self.0
            .insert(field.to_string(), serde_json::to_value(value).unwrap_or(Value::Null));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Version and watermarks are owned by the store.
    pub fn validate(&self) -> Result<(), StoreError> {
        for reserved in [VERSION_FIELD, WATERMARKS_FIELD] {
            if self.0.contains_key(reserved) {
                return Err(StoreError::InvalidPatch(format!(
                    "field '{reserved}' is managed by the store"
                )));
            }
        }
        Ok(())
    }

    /// Apply to `doc` and return the fields whose value actually changed.
    pub fn apply(&self, doc: &mut Value) -> Result<Vec<String>, StoreError> {
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| StoreError::Decode("document is not a JSON object".to_string()))?;

        let mut changed = Vec::new();
        for (field, value) in &self.0 {
            if obj.get(field) != Some(value) {
                obj.insert(field.clone(), value.clone());
                changed.push(field.clone());
            }
        }
        Ok(changed)
    }
}

pub(crate) fn encode<A: VersionedAggregate>(doc: &A) -> Result<Value, StoreError> {
    serde_json::to_value(doc).map_err(|e| StoreError::Decode(e.to_string()))
}

pub(crate) fn decode<A: VersionedAggregate>(doc: Value) -> Result<A, StoreError> {
    serde_json::from_value(doc)
        .map_err(|e| StoreError::Decode(format!("{}: {e}", A::COLLECTION)))
}

pub(crate) fn read_version(doc: &Value) -> u64 {
    doc.get(VERSION_FIELD).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn write_version(doc: &mut Value, version: u64) {
    if let Some(obj) = doc.as_object_mut() {
        obj.insert(VERSION_FIELD.to_string(), Value::from(version));
    }
}

/// Persistent document store for one aggregate type.
///
/// Every method is atomic per document. Nothing spans documents: callers that
/// touch several aggregates make each write conditional on what they observed.
#[async_trait]
pub trait DocumentStore<A: VersionedAggregate>: Send + Sync {
    async fn get(&self, id: A::Id) -> Result<Option<A>, StoreError>;

    /// Insert a new document at version 1.
    async fn insert(&self, doc: A) -> Result<A, StoreError>;

    /// Insert unless a document matching `unless` already exists (checked atomically).
    /// Returns `None` when an existing document matched.
    async fn insert_unless(&self, doc: A, unless: &[Filter]) -> Result<Option<A>, StoreError>;

    /// Advance `field`'s watermark to `version` iff it is unset or lower.
    ///
    /// Returns the updated document, or `None` if the watermark is already at or past
    /// `version` or the document does not exist. Does not bump the version.
    async fn claim(
        &self,
        id: A::Id,
        field: WatermarkField,
        version: u64,
    ) -> Result<Option<A>, StoreError>;

    /// Apply `patch` iff the document matches every filter.
    ///
    /// Returns `None` when the document is missing or a filter failed. A patch that
    /// changes nothing returns the document without bumping the version.
    async fn update_where(
        &self,
        id: A::Id,
        filters: &[Filter],
        patch: Patch,
    ) -> Result<Option<A>, StoreError>;

    /// [`DocumentStore::update_where`] over every matching document.
    /// Returns the documents actually changed.
    async fn update_many_where(&self, filters: &[Filter], patch: Patch)
    -> Result<Vec<A>, StoreError>;

    async fn find(&self, filters: &[Filter]) -> Result<Vec<A>, StoreError>;
}

/// Shared handle used by handlers and the engine.
pub type SharedStore<A> = Arc<dyn DocumentStore<A>>;
