use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use haulage_events::{ChangeEvent, FeedFilter};
use haulage_fleet::load::fields;
use haulage_fleet::{Leg, Load, STOPS_WATERMARK, plan_route};

use crate::collaborators::DistanceService;
use crate::gate::VersionGate;
use crate::queue::TaskHandler;
use crate::store::{Filter, Patch, SharedStore};

use super::HandlerError;

/// Recomputes legs, total distance and the time span of a load when its stops change.
pub struct LoadRouteHandler {
    loads: SharedStore<Load>,
    gate: VersionGate<Load>,
    distances: Arc<dyn DistanceService>,
}

impl LoadRouteHandler {
    pub fn new(loads: SharedStore<Load>, distances: Arc<dyn DistanceService>) -> Self {
        Self {
            gate: VersionGate::new(loads.clone(), STOPS_WATERMARK),
            loads,
            distances,
        }
    }

    /// Inserts and any update touching `stops`.
    pub fn feed_filter() -> FeedFilter<Load> {
        FeedFilter::all().fields([fields::STOPS])
    }

    /// Returns the written load, or `None` if the claim or the conditional write lost.
    pub async fn reconcile(&self, event: &ChangeEvent<Load>) -> Result<Option<Load>, HandlerError> {
        let Some(current) = self.gate.claim(event.document_id(), event.version()).await? else {
            return Ok(None);
        };

        // Known legs: whatever is stored now, then the pre-change snapshot.
        let known: Vec<Leg> = current
            .legs
            .iter()
            .chain(event.before().map(|b| b.legs.as_slice()).unwrap_or_default())
            .cloned()
            .collect();

        let mut plan = plan_route(&current.stops, &known);
        let pending: Vec<(usize, Leg)> = plan.pending().map(|(i, leg)| (i, leg.clone())).collect();

        for (index, leg) in pending {
            match self.distances.distance(leg.from_facility, leg.to_facility).await {
                Ok(miles) => plan.resolve(index, Some(miles)),
                Err(e) => {
                    warn!(
                        load_id = %current.id,
                        from = %leg.from_facility,
                        to = %leg.to_facility,
                        error = %e,
                        "distance lookup failed"
                    );
                    plan.resolve(index, None);
                }
            }
        }

        let summary = plan.finish(&current.stops);
        let written = self
            .loads
            .update_where(
                current.id,
                &[Filter::eq(fields::STOPS, &current.stops)],
                Patch::new()
                    .set(fields::LEGS, &summary.legs)
                    .set(fields::TOTAL_DISTANCE, summary.total_distance)
                    .set(fields::START_TIME, summary.start_time)
                    .set(fields::END_TIME, summary.end_time),
            )
            .await?;

        match &written {
            Some(load) => debug!(
                load_id = %load.id,
                total_distance = ?load.total_distance,
                "route recomputed"
            ),
            None => debug!(
                load_id = %current.id,
                "stops changed during recomputation; newer event will recompute"
            ),
        }
        Ok(written)
    }
}

#[async_trait]
impl TaskHandler<ChangeEvent<Load>> for LoadRouteHandler {
    async fn handle(&self, event: ChangeEvent<Load>) -> Result<(), HandlerError> {
        self.reconcile(&event).await.map(|_| ())
    }

    fn describe(&self, event: &ChangeEvent<Load>) -> String {
        event.describe()
    }
}
