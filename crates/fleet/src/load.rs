use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haulage_core::{
    FacilityId, LoadId, StopId, TruckId, VersionedAggregate, WatermarkField, Watermarks,
};

use crate::stop::Stop;

/// Watermark of the route (distance/time-window) recomputation concern.
pub const STOPS_WATERMARK: WatermarkField = WatermarkField::new("stops");

/// Watermark of the load/truck status derivation concern.
pub const STATUS_WATERMARK: WatermarkField = WatermarkField::new("status");

/// Document field names used by feed filters and conditional writes.
pub mod fields {
    pub const STOPS: &str = "stops";
    pub const TRUCK_ID: &str = "truck_id";
    pub const STATUS: &str = "status";
    pub const OCCUPIED_TRUCK: &str = "occupied_truck";
    pub const LEGS: &str = "legs";
    pub const TOTAL_DISTANCE: &str = "total_distance";
    pub const START_TIME: &str = "start_time";
    pub const END_TIME: &str = "end_time";
}

/// Load status lifecycle.
///
/// `Completed`, `Cancelled` and `TONU` (truck ordered, not used) are terminal;
/// the engine never reconciles a terminal load back into the active states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadStatus {
    Available,
    Planned,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Cancelled,
    #[serde(rename = "TONU")]
    Tonu,
}

impl LoadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoadStatus::Completed | LoadStatus::Cancelled | LoadStatus::Tonu
        )
    }
}

/// Distance between two consecutive stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub from_stop: StopId,
    pub from_facility: FacilityId,
    pub to_stop: StopId,
    pub to_facility: FacilityId,
    /// Miles; `None` when the lookup was unavailable.
    pub distance: Option<f64>,
}

impl Leg {
    pub fn between(from: &Stop, to: &Stop, distance: Option<f64>) -> Self {
        Self {
            from_stop: from.id,
            from_facility: from.facility_id,
            to_stop: to.id,
            to_facility: to.facility_id,
            distance,
        }
    }

    /// Same stop pair at the same facilities (distance ignored).
    pub fn connects(&self, from: &Stop, to: &Stop) -> bool {
        self.from_stop == from.id
            && self.from_facility == from.facility_id
            && self.to_stop == to.id
            && self.to_facility == to.facility_id
    }
}

/// Aggregate root: Load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub reference: String,
    pub stops: Vec<Stop>,
    pub truck_id: Option<TruckId>,
    pub status: LoadStatus,
    /// Truck this load was last put `In Progress` on by the status concern.
    /// Written together with the status; cleared when the load stops holding it.
    #[serde(default)]
    pub occupied_truck: Option<TruckId>,

    // Derived by the route concern.
    #[serde(default)]
    pub legs: Vec<Leg>,
    #[serde(default)]
    pub total_distance: Option<f64>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub watermarks: Watermarks,
}

impl Load {
    /// A new, unassigned load (`Available`).
    pub fn new(reference: impl Into<String>, stops: Vec<Stop>) -> Self {
        Self {
            id: LoadId::new(),
            reference: reference.into(),
            stops,
            truck_id: None,
            status: LoadStatus::Available,
            occupied_truck: None,
            legs: Vec::new(),
            total_distance: None,
            start_time: None,
            end_time: None,
            version: 0,
            watermarks: Watermarks::new(),
        }
    }

    pub fn with_truck(mut self, truck_id: TruckId) -> Self {
        self.truck_id = Some(truck_id);
        self
    }

    /// True when there is at least one stop and every stop reached its terminal status.
    pub fn all_stops_terminal(&self) -> bool {
        !self.stops.is_empty() && self.stops.iter().all(Stop::is_terminal)
    }

    /// Scheduled start: the first stop's window start.
    ///
    /// Read straight from the stops so that ordering loads never depends on the
    /// route concern having caught up.
    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        self.stops.first().map(|s| s.window.start)
    }

    pub fn is_in_progress_on(&self, truck_id: TruckId) -> bool {
        self.status == LoadStatus::InProgress && self.truck_id == Some(truck_id)
    }
}

impl VersionedAggregate for Load {
    type Id = LoadId;
    const COLLECTION: &'static str = "loads";

    fn id(&self) -> LoadId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    fn watermarks_mut(&mut self) -> &mut Watermarks {
        &mut self.watermarks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::TimeWindow;
    use chrono::TimeZone;

    fn stop_at(hour: u32) -> Stop {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap();
        Stop::pickup(
            FacilityId::new(),
            TimeWindow::new(start, start + chrono::Duration::hours(1)).unwrap(),
        )
    }

    #[test]
    fn new_load_is_available_and_unassigned() {
        let load = Load::new("L-100", vec![stop_at(8)]);
        assert_eq!(load.status, LoadStatus::Available);
        assert!(load.truck_id.is_none());
        assert!(load.occupied_truck.is_none());
        assert_eq!(load.version, 0);
    }

    #[test]
    fn empty_load_is_never_all_terminal() {
        let load = Load::new("L-101", vec![]);
        assert!(!load.all_stops_terminal());
    }

    #[test]
    fn all_stops_terminal_requires_every_stop() {
        let mut load = Load::new("L-102", vec![stop_at(8), stop_at(12)]);
        load.stops[1].complete();
        assert!(!load.all_stops_terminal());
        load.stops[0].complete();
        assert!(load.all_stops_terminal());
    }

    #[test]
    fn documents_without_occupied_truck_decode() {
        let load = Load::new("L-105", vec![stop_at(8)]).with_truck(TruckId::new());
        let mut doc = serde_json::to_value(&load).unwrap();
        doc.as_object_mut().unwrap().remove(fields::OCCUPIED_TRUCK);
        let decoded: Load = serde_json::from_value(doc).unwrap();
        assert_eq!(decoded.occupied_truck, None);
    }

    #[test]
    fn in_progress_on_requires_status_and_truck() {
        let truck = TruckId::new();
        let mut load = Load::new("L-106", vec![stop_at(8)]).with_truck(truck);
        assert!(!load.is_in_progress_on(truck));
        load.status = LoadStatus::InProgress;
        assert!(load.is_in_progress_on(truck));
        assert!(!load.is_in_progress_on(TruckId::new()));
    }

    #[test]
    fn scheduled_start_is_first_stop_window() {
        let load = Load::new("L-103", vec![stop_at(9), stop_at(7)]);
        assert_eq!(
            load.scheduled_start(),
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(LoadStatus::Completed.is_terminal());
        assert!(LoadStatus::Cancelled.is_terminal());
        assert!(LoadStatus::Tonu.is_terminal());
        assert!(!LoadStatus::Planned.is_terminal());
        assert_eq!(
            serde_json::to_value(LoadStatus::InProgress).unwrap(),
            serde_json::json!("In Progress")
        );
    }

    #[test]
    fn document_carries_version_and_watermarks_at_top_level() {
        let load = Load::new("L-104", vec![]);
        let doc = serde_json::to_value(&load).unwrap();
        assert_eq!(doc[haulage_core::aggregate::VERSION_FIELD], serde_json::json!(0));
        assert_eq!(
            doc[haulage_core::aggregate::WATERMARKS_FIELD],
            serde_json::json!({})
        );
    }
}
