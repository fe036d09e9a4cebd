use serde::{Deserialize, Serialize};

use haulage_core::{DriverId, TruckId, VersionedAggregate, Watermarks};

pub mod fields {
    pub const STATUS: &str = "status";
}

/// Truck availability.
///
/// `On route` and `Available` are driven by load reconciliation; `Not Available`
/// and `Will be available` are set by dispatchers and are never overwritten by
/// a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TruckStatus {
    Available,
    #[serde(rename = "Not Available")]
    NotAvailable,
    #[serde(rename = "Will be available")]
    WillBeAvailable,
    #[serde(rename = "On route")]
    OnRoute,
}

/// Aggregate root: Truck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
    pub id: TruckId,
    pub unit_number: String,
    pub driver_id: Option<DriverId>,
    pub status: TruckStatus,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub watermarks: Watermarks,
}

impl Truck {
    pub fn new(unit_number: impl Into<String>) -> Self {
        Self {
            id: TruckId::new(),
            unit_number: unit_number.into(),
            driver_id: None,
            status: TruckStatus::Available,
            version: 0,
            watermarks: Watermarks::new(),
        }
    }

    pub fn with_driver(mut self, driver_id: DriverId) -> Self {
        self.driver_id = Some(driver_id);
        self
    }
}

impl VersionedAggregate for Truck {
    type Id = TruckId;
    const COLLECTION: &'static str = "trucks";

    fn id(&self) -> TruckId {
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
