//! Fleet domain module: loads, stops, trucks and outbound messages.
//!
//! This crate contains business rules implemented purely as deterministic
//! domain logic (no IO, no async, no storage). The reconciliation handlers in
//! `haulage-infra` read current state, ask [`reconcile`] what it should become,
//! and persist the answer with conditional writes.

pub mod load;
pub mod message;
pub mod reconcile;
pub mod stop;
pub mod truck;

pub use load::{Leg, Load, LoadStatus, STATUS_WATERMARK, STOPS_WATERMARK};
pub use message::{Message, MessageChannel, MessagePayload, MessageState};
pub use reconcile::{
    RoutePlan, RouteSummary, StatusPlan, plan_route, plan_status, precedes, select_promotion,
};
pub use stop::{Stop, StopKind, StopStatus, TimeWindow};
pub use truck::{Truck, TruckStatus};
