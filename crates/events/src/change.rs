use haulage_core::VersionedAggregate;

/// Kind of persisted mutation reported by the feed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OperationKind::Insert),
            "update" => Some(OperationKind::Update),
            _ => None,
        }
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single data-change notification, decoded once at the feed boundary.
///
/// Notes:
/// - **Immutable**: treat it as a fact about the past.
/// - `version` is the aggregate's write-version *after* the change. Handlers use
///   it as the claim version, never as a description of current state.
/// - Snapshots are hints (e.g. "which truck was this load on before?"). Current
///   state must be re-read under a claim.
/// - The feed is at-least-once: the same event may be delivered again.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<A: VersionedAggregate> {
    Insert {
        document_id: A::Id,
        version: u64,
        after: A,
    },
    Update {
        document_id: A::Id,
        version: u64,
        changed_fields: Vec<String>,
        before: Option<A>,
        after: Option<A>,
    },
}

impl<A: VersionedAggregate> ChangeEvent<A> {
    pub fn operation(&self) -> OperationKind {
        match self {
            ChangeEvent::Insert { .. } => OperationKind::Insert,
            ChangeEvent::Update { .. } => OperationKind::Update,
        }
    }

    pub fn document_id(&self) -> A::Id {
        match self {
            ChangeEvent::Insert { document_id, .. } | ChangeEvent::Update { document_id, .. } => {
                *document_id
            }
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            ChangeEvent::Insert { version, .. } | ChangeEvent::Update { version, .. } => *version,
        }
    }

    /// Fields modified by the change (empty for inserts).
    pub fn changed_fields(&self) -> &[String] {
        match self {
            ChangeEvent::Insert { .. } => &[],
            ChangeEvent::Update { changed_fields, .. } => changed_fields,
        }
    }

    /// Whether the change touched `field`. Inserts touch every field.
    pub fn touches(&self, field: &str) -> bool {
        match self {
            ChangeEvent::Insert { .. } => true,
            ChangeEvent::Update { changed_fields, .. } => {
                changed_fields.iter().any(|f| f == field)
            }
        }
    }

    pub fn before(&self) -> Option<&A> {
        match self {
            ChangeEvent::Insert { .. } => None,
            ChangeEvent::Update { before, .. } => before.as_ref(),
        }
    }

    pub fn after(&self) -> Option<&A> {
        match self {
            ChangeEvent::Insert { after, .. } => Some(after),
            ChangeEvent::Update { after, .. } => after.as_ref(),
        }
    }

    /// Short identity used in logs: `loads/<id>@<version>`.
    pub fn describe(&self) -> String {
        format!("{}/{}@{}", A::COLLECTION, self.document_id(), self.version())
    }
}
