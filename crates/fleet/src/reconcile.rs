//! Pure reconciliation decisions.
//!
//! Everything here is deterministic and side-effect free: given the current
//! state of a load (plus whatever related state the caller already read), decide
//! what the load and its truck should become. Persisting the decision is the
//! caller's job.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use haulage_core::TruckId;

use crate::load::{Leg, Load, LoadStatus};
use crate::stop::Stop;

/// What the status rules decided for one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPlan {
    /// Status the load should have. `None` for terminal loads, which are never
    /// moved again.
    pub target: Option<LoadStatus>,
    /// Trucks the load no longer occupies. Releasing a truck is idempotent, so
    /// this may over-approximate.
    pub release: Vec<TruckId>,
    /// Truck that must be `On route` because this load is now in progress on it.
    /// Persisted as the load's `occupied_truck` together with `target`.
    pub occupy: Option<TruckId>,
}

impl StatusPlan {
    /// True when the load must be written: its status or occupied truck moves.
    pub fn changes(&self, current: &Load) -> bool {
        self.target.is_some_and(|t| t != current.status) || self.occupy != current.occupied_truck
    }
}

/// Load ordering used for promotion and conflict resolution: earliest scheduled
/// start first, loads without stops last, id as the tie-breaker.
pub fn precedes(a: &Load, b: &Load) -> bool {
    compare_start(a, b) == Ordering::Less
}

fn compare_start(a: &Load, b: &Load) -> Ordering {
    let key = |l: &Load| (l.scheduled_start().is_none(), l.scheduled_start(), l.id);
    key(a).cmp(&key(b))
}

/// The load that should hold a truck among `candidates` (earliest start).
pub fn select_promotion<'a>(candidates: impl IntoIterator<Item = &'a Load>) -> Option<&'a Load> {
    candidates.into_iter().min_by(|a, b| compare_start(a, b))
}

/// Evaluate the load status rules.
///
/// - `current`: the claimed, current document. Its `occupied_truck` says which
///   truck an earlier reconciliation put it in progress on, whatever the
///   delivery order of the events that moved it since.
/// - `others_in_progress`: other loads currently `In Progress` on
///   `current.truck_id` (ignored when no truck is assigned)
pub fn plan_status(current: &Load, others_in_progress: &[Load]) -> StatusPlan {
    let target = if current.status.is_terminal() {
        None
    } else if current.all_stops_terminal() {
        Some(LoadStatus::Completed)
    } else {
        match current.truck_id {
            None => Some(LoadStatus::Available),
            Some(_) => {
                let busy = others_in_progress.iter().any(|other| {
                    other.id != current.id
                        && (current.status != LoadStatus::InProgress || precedes(other, current))
                });
                if busy {
                    Some(LoadStatus::Planned)
                } else {
                    Some(LoadStatus::InProgress)
                }
            }
        }
    };

    let final_status = target.unwrap_or(current.status);
    let occupy = if final_status == LoadStatus::InProgress {
        current.truck_id
    } else {
        None
    };

    let mut release: Vec<TruckId> = current.occupied_truck.into_iter().collect();
    if let Some(t) = current.truck_id {
        // Status written by someone else; occupied_truck may not know about it.
        if current.status == LoadStatus::InProgress || final_status.is_terminal() {
            release.push(t);
        }
    }
    release.retain(|t| Some(*t) != occupy);
    release.sort();
    release.dedup();

    StatusPlan {
        target,
        release,
        occupy,
    }
}

/// Derived route fields of a load.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSummary {
    pub legs: Vec<Leg>,
    /// Sum of all leg distances; `None` if any leg is unknown or there are no stops.
    pub total_distance: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Legs of a route, some of which still need a distance lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    legs: Vec<Leg>,
    pending: Vec<usize>,
}

/// Build the leg list for `stops`, reusing known distances from `previous` legs
/// whose stop pair is unchanged (same stop ids and same facilities).
pub fn plan_route(stops: &[Stop], previous: &[Leg]) -> RoutePlan {
    let mut legs = Vec::with_capacity(stops.len().saturating_sub(1));
    let mut pending = Vec::new();

    for (idx, pair) in stops.windows(2).enumerate() {
        let (from, to) = (&pair[0], &pair[1]);
        let reused = previous
            .iter()
            .find(|leg| leg.connects(from, to))
            .and_then(|leg| leg.distance);

        if reused.is_none() {
            pending.push(idx);
        }
        legs.push(Leg::between(from, to, reused));
    }

    RoutePlan { legs, pending }
}

impl RoutePlan {
    /// Legs that need a lookup, with their index.
    pub fn pending(&self) -> impl Iterator<Item = (usize, &Leg)> + '_ {
        self.pending.iter().map(|i| (*i, &self.legs[*i]))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record a lookup result (`None` = unavailable).
    pub fn resolve(&mut self, index: usize, distance: Option<f64>) {
        if let Some(leg) = self.legs.get_mut(index) {
            leg.distance = distance;
        }
    }

    pub fn finish(self, stops: &[Stop]) -> RouteSummary {
        let total_distance = if stops.is_empty() {
            None
        } else {
            self.legs
                .iter()
                .try_fold(0.0_f64, |acc, leg| leg.distance.map(|d| acc + d))
        };

        RouteSummary {
            legs: self.legs,
            total_distance,
            start_time: stops.first().map(|s| s.window.start),
            end_time: stops.last().map(|s| s.window.end),
        }
    }
}
