//! Versioned aggregate contract for change-driven reconciliation.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level document key holding the aggregate write-version.
pub const VERSION_FIELD: &str = "version";

/// Top-level document key holding the watermark map.
pub const WATERMARKS_FIELD: &str = "watermarks";

/// Name of one reconciliation concern tracked on an aggregate.
///
/// Each concern (route recomputation, status derivation, ...) owns exactly one
/// watermark and advances it only through a claim.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatermarkField(&'static str);

impl WatermarkField {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl core::fmt::Display for WatermarkField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0)
    }
}

/// Per-concern record of "the write-version as of which this concern was last
/// reconciled".
///
/// Watermarks are monotonic: [`Watermarks::try_advance`] is the only mutation and
/// it never moves a watermark backwards or re-claims the same version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermarks(BTreeMap<String, u64>);

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark for a concern (`None` if never reconciled).
    pub fn get(&self, field: WatermarkField) -> Option<u64> {
        self.0.get(field.name()).copied()
    }

    /// Advance `field` to `version` iff it is unset or strictly lower.
    ///
    /// Returns `true` when the caller now owns the reconciliation of `version`.
    pub fn try_advance(&mut self, field: WatermarkField, version: u64) -> bool {
        match self.0.get(field.name()) {
            Some(current) if *current >= version => false,
            _ => {
                self.0.insert(field.name().to_string(), version);
                true
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A persisted entity that participates in reconciliation.
///
/// Aggregates are stored as documents: they serialize to a JSON object carrying
/// [`VERSION_FIELD`] and [`WATERMARKS_FIELD`] at the top level. The store owns
/// both values; domain code only reads them.
pub trait VersionedAggregate:
    Clone + core::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Strongly-typed identifier (UUID-backed).
    type Id: Copy
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + core::fmt::Display
        + Send
        + Sync
        + Into<Uuid>
        + From<Uuid>
        + 'static;

    /// Store collection name (e.g. "loads").
    const COLLECTION: &'static str;

    fn id(&self) -> Self::Id;

    /// Monotonically increasing write-version, bumped by every persisted mutation
    /// of business fields.
    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    fn watermarks(&self) -> &Watermarks;

    fn watermarks_mut(&mut self) -> &mut Watermarks;
}
