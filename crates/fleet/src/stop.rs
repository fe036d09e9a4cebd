use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haulage_core::{DomainError, DomainResult, FacilityId, StopId};

/// Pickup or delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopKind {
    Pickup,
    Delivery,
}

/// Progress of a single stop.
///
/// Each [`StopKind`] walks its own ordered list; the last entry is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopStatus {
    Pending,
    #[serde(rename = "En Route")]
    EnRoute,
    Arrived,
    Loading,
    Loaded,
    Unloading,
    Delivered,
}

const PICKUP_FLOW: &[StopStatus] = &[
    StopStatus::Pending,
    StopStatus::EnRoute,
    StopStatus::Arrived,
    StopStatus::Loading,
    StopStatus::Loaded,
];

const DELIVERY_FLOW: &[StopStatus] = &[
    StopStatus::Pending,
    StopStatus::EnRoute,
    StopStatus::Arrived,
    StopStatus::Unloading,
    StopStatus::Delivered,
];

impl StopKind {
    /// Ordered status list for this kind of stop.
    pub fn flow(&self) -> &'static [StopStatus] {
        match self {
            StopKind::Pickup => PICKUP_FLOW,
            StopKind::Delivery => DELIVERY_FLOW,
        }
    }

    pub fn terminal_status(&self) -> StopStatus {
        match self {
            StopKind::Pickup => StopStatus::Loaded,
            StopKind::Delivery => StopStatus::Delivered,
        }
    }
}

/// Appointment window at a facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> DomainResult<Self> {
        if end < start {
            return Err(DomainError::validation(
                "time window end must not precede its start",
            ));
        }
        Ok(Self { start, end })
    }
}

/// One stop of a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub kind: StopKind,
    pub facility_id: FacilityId,
    pub window: TimeWindow,
    pub status: StopStatus,
}

impl Stop {
    pub fn new(kind: StopKind, facility_id: FacilityId, window: TimeWindow) -> Self {
        Self {
            id: StopId::new(),
            kind,
            facility_id,
            window,
            status: StopStatus::Pending,
        }
    }

    pub fn pickup(facility_id: FacilityId, window: TimeWindow) -> Self {
        Self::new(StopKind::Pickup, facility_id, window)
    }

    pub fn delivery(facility_id: FacilityId, window: TimeWindow) -> Self {
        Self::new(StopKind::Delivery, facility_id, window)
    }

    pub fn is_terminal(&self) -> bool {
        self.status == self.kind.terminal_status()
    }

    /// Move to the next status of this stop's flow.
    pub fn advance(&mut self) -> DomainResult<StopStatus> {
        let flow = self.kind.flow();
        let pos = flow.iter().position(|s| *s == self.status).ok_or_else(|| {
            DomainError::invariant(format!(
                "stop status {:?} is not part of the {:?} flow",
                self.status, self.kind
            ))
        })?;

        let next = flow.get(pos + 1).copied().ok_or_else(|| {
            DomainError::invariant(format!("stop {} is already {:?}", self.id, self.status))
        })?;

        self.status = next;
        Ok(next)
    }

    /// Drive the stop straight to its terminal status.
    pub fn complete(&mut self) {
        self.status = self.kind.terminal_status();
    }
}
