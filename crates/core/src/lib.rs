//! `haulage-core`: foundation building blocks shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the versioned-aggregate contract that
//! the reconciliation engine relies on.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{VersionedAggregate, WatermarkField, Watermarks};
pub use error::{DomainError, DomainResult};
pub use id::{DriverId, FacilityId, LoadId, MessageId, StopId, TruckId};
