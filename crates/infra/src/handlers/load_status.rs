use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use haulage_core::{LoadId, TruckId};
use haulage_events::{ChangeEvent, FeedFilter};
use haulage_fleet::load::fields;
use haulage_fleet::message::fields as message_fields;
use haulage_fleet::truck::fields as truck_fields;
use haulage_fleet::{
    Load, LoadStatus, Message, STATUS_WATERMARK, Truck, TruckStatus, plan_status, select_promotion,
};

use crate::gate::VersionGate;
use crate::queue::TaskHandler;
use crate::store::{Filter, Patch, SharedStore};

use super::HandlerError;

/// Key under which the "load started" push for one load version is created.
pub fn in_progress_dedupe_key(load: &Load) -> String {
    format!("load:{}:in-progress:{}", load.id, load.version)
}

/// Derives load status from stops and truck assignment, and keeps the truck's
/// status and driver notifications in step with it.
pub struct LoadStatusHandler {
    loads: SharedStore<Load>,
    trucks: SharedStore<Truck>,
    messages: SharedStore<Message>,
    gate: VersionGate<Load>,
}

impl LoadStatusHandler {
    pub fn new(
        loads: SharedStore<Load>,
        trucks: SharedStore<Truck>,
        messages: SharedStore<Message>,
    ) -> Self {
        Self {
            gate: VersionGate::new(loads.clone(), STATUS_WATERMARK),
            loads,
            trucks,
            messages,
        }
    }

    /// Inserts and updates touching stops, truck assignment or status.
    pub fn feed_filter() -> FeedFilter<Load> {
        FeedFilter::all().fields([fields::STOPS, fields::TRUCK_ID, fields::STATUS])
    }

    /// Returns the load as this handler left it, or `None` if the claim or the
    /// status write lost to a concurrent change.
    #[instrument(skip(self, event), fields(load_id = %event.document_id(), version = event.version()), err)]
    pub async fn reconcile(&self, event: &ChangeEvent<Load>) -> Result<Option<Load>, HandlerError> {
        let Some(current) = self.gate.claim(event.document_id(), event.version()).await? else {
            return Ok(None);
        };

        let others = match current.truck_id {
            Some(truck) => {
                let mut active = self.in_progress_on(truck).await?;
                active.retain(|l| l.id != current.id);
                active
            }
            None => Vec::new(),
        };
        let plan = plan_status(&current, &others);

        let mut load = current.clone();
        if plan.changes(&current) {
            let status = plan.target.unwrap_or(current.status);
            let written = self
                .loads
                .update_where(
                    current.id,
                    &[
                        Filter::eq(fields::STATUS, current.status),
                        Filter::eq(fields::TRUCK_ID, current.truck_id),
                        Filter::eq(fields::OCCUPIED_TRUCK, current.occupied_truck),
                    ],
                    Patch::new()
                        .set(fields::STATUS, status)
                        .set(fields::OCCUPIED_TRUCK, plan.occupy),
                )
                .await?;
            match written {
                Some(updated) => {
                    if status != current.status {
                        info!(load_id = %updated.id, from = ?current.status, to = ?status, "load status changed");
                    }
                    load = updated;
                }
                None => {
                    debug!(load_id = %current.id, "load changed concurrently; newer event will reconcile");
                    return Ok(None);
                }
            }
        }

        for truck in &plan.release {
            self.release_truck(*truck).await?;
        }

        if let Some(truck) = plan.occupy {
            self.occupy_truck(load.id, truck).await?;
            if current.occupied_truck != Some(truck) {
                self.notify_driver(&load, truck).await?;
                self.resolve_conflict(truck).await?;
            }
        }

        Ok(Some(load))
    }

    async fn in_progress_on(&self, truck: TruckId) -> Result<Vec<Load>, HandlerError> {
        Ok(self
            .loads
            .find(&[
                Filter::eq(fields::TRUCK_ID, truck),
                Filter::eq(fields::STATUS, LoadStatus::InProgress),
            ])
            .await?)
    }

    /// Hand the truck to its earliest Planned load, or mark it Available.
    async fn release_truck(&self, truck: TruckId) -> Result<(), HandlerError> {
        if !self.in_progress_on(truck).await?.is_empty() {
            debug!(truck_id = %truck, "truck still has a load in progress");
            return Ok(());
        }

        let mut planned = self
            .loads
            .find(&[
                Filter::eq(fields::TRUCK_ID, truck),
                Filter::eq(fields::STATUS, LoadStatus::Planned),
            ])
            .await?;

        while let Some(next_id) = select_promotion(&planned).map(|l| l.id) {
            planned.retain(|l| l.id != next_id);
            let promoted = self
                .loads
                .update_where(
                    next_id,
                    &[
                        Filter::eq(fields::STATUS, LoadStatus::Planned),
                        Filter::eq(fields::TRUCK_ID, truck),
                    ],
                    Patch::new()
                        .set(fields::STATUS, LoadStatus::InProgress)
                        .set(fields::OCCUPIED_TRUCK, truck),
                )
                .await?;
            if let Some(promoted) = promoted {
                info!(truck_id = %truck, load_id = %promoted.id, "planned load promoted");
                self.occupy_truck(promoted.id, truck).await?;
                self.notify_driver(&promoted, truck).await?;
                self.resolve_conflict(truck).await?;
                return Ok(());
            }
        }

        self.free_if_idle(truck).await
    }

    /// `On route` to `Available`, unless a load took the truck meanwhile.
    async fn free_if_idle(&self, truck: TruckId) -> Result<(), HandlerError> {
        if !self.in_progress_on(truck).await?.is_empty() {
            return Ok(());
        }
        let freed = self
            .trucks
            .update_where(
                truck,
                &[Filter::eq(truck_fields::STATUS, TruckStatus::OnRoute)],
                Patch::new().set(truck_fields::STATUS, TruckStatus::Available),
            )
            .await?;
        if freed.is_some() {
            info!(truck_id = %truck, "truck released");
        }
        Ok(())
    }

    /// Put `truck` on route for `load`.
    ///
    /// The write is conditional on the truck status read here and only happens
    /// while the load is still in progress on the truck. A release that slips in
    /// between the check and the write is caught by the re-check afterwards.
    async fn occupy_truck(&self, load: LoadId, truck: TruckId) -> Result<(), HandlerError> {
        let Some(observed) = self.trucks.get(truck).await? else {
            warn!(truck_id = %truck, "assigned truck not found");
            return Ok(());
        };
        if observed.status == TruckStatus::OnRoute {
            return Ok(());
        }
        if !self.still_in_progress(load, truck).await? {
            debug!(truck_id = %truck, load_id = %load, "load left the truck; not occupying");
            return Ok(());
        }

        let occupied = self
            .trucks
            .update_where(
                truck,
                &[Filter::eq(truck_fields::STATUS, observed.status)],
                Patch::new().set(truck_fields::STATUS, TruckStatus::OnRoute),
            )
            .await?;
        if occupied.is_none() {
            debug!(truck_id = %truck, "truck changed concurrently; not occupying");
            return Ok(());
        }

        if !self.still_in_progress(load, truck).await? {
            self.free_if_idle(truck).await?;
        }
        Ok(())
    }

    async fn still_in_progress(&self, load: LoadId, truck: TruckId) -> Result<bool, HandlerError> {
        Ok(self
            .loads
            .get(load)
            .await?
            .is_some_and(|l| l.is_in_progress_on(truck)))
    }

    async fn notify_driver(&self, load: &Load, truck: TruckId) -> Result<(), HandlerError> {
        let Some(driver) = self.trucks.get(truck).await?.and_then(|t| t.driver_id) else {
            debug!(truck_id = %truck, "truck has no driver; no push");
            return Ok(());
        };

        let key = in_progress_dedupe_key(load);
        let message = Message::push(
            driver,
            format!("Load {} started", load.reference),
            format!("Load {} is now in progress.", load.reference),
        )
        .ready()
        .with_dedupe_key(key.clone());

        match self
            .messages
            .insert_unless(message, &[Filter::eq(message_fields::DEDUPE_KEY, &key)])
            .await?
        {
            Some(created) => debug!(message_id = %created.id, dedupe_key = %key, "driver push queued"),
            None => debug!(dedupe_key = %key, "driver push already queued"),
        }
        Ok(())
    }

    /// Keep only the earliest-starting load In Progress on `truck`.
    async fn resolve_conflict(&self, truck: TruckId) -> Result<(), HandlerError> {
        let active = self.in_progress_on(truck).await?;
        let Some(winner) = select_promotion(&active).map(|l| l.id) else {
            return Ok(());
        };

        for rival in active.iter().filter(|l| l.id != winner) {
            let demoted = self
                .loads
                .update_where(
                    rival.id,
                    &[
                        Filter::eq(fields::STATUS, LoadStatus::InProgress),
                        Filter::eq(fields::TRUCK_ID, truck),
                    ],
                    Patch::new()
                        .set(fields::STATUS, LoadStatus::Planned)
                        .set(fields::OCCUPIED_TRUCK, Option::<TruckId>::None),
                )
                .await?;
            if demoted.is_some() {
                info!(truck_id = %truck, load_id = %rival.id, winner = %winner, "conflicting load demoted");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler<ChangeEvent<Load>> for LoadStatusHandler {
    async fn handle(&self, event: ChangeEvent<Load>) -> Result<(), HandlerError> {
        self.reconcile(&event).await.map(|_| ())
    }

    fn describe(&self, event: &ChangeEvent<Load>) -> String {
        event.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use haulage_core::{DriverId, FacilityId};
    use haulage_fleet::{MessageChannel, Stop, StopStatus, TimeWindow};

    use crate::store::{DocumentStore, InMemoryDocumentStore};

    struct Fixture {
        loads: SharedStore<Load>,
        trucks: SharedStore<Truck>,
        messages: SharedStore<Message>,
        handler: LoadStatusHandler,
    }

    fn fixture() -> Fixture {
        let loads: SharedStore<Load> = InMemoryDocumentStore::<Load>::arc();
        let trucks: SharedStore<Truck> = InMemoryDocumentStore::<Truck>::arc();
        let messages: SharedStore<Message> = InMemoryDocumentStore::<Message>::arc();
        let handler = LoadStatusHandler::new(loads.clone(), trucks.clone(), messages.clone());
        Fixture {
            loads,
            trucks,
            messages,
            handler,
        }
    }

    fn stops_at(hour: u32) -> Vec<Stop> {
        let start = Utc.with_ymd_and_hms(2026, 5, 2, hour, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + chrono::Duration::hours(2)).unwrap();
        vec![
            Stop::pickup(FacilityId::new(), window),
            Stop::delivery(FacilityId::new(), window),
        ]
    }

    impl Fixture {
        async fn truck(&self) -> Truck {
            self.trucks
                .insert(Truck::new("T-100").with_driver(DriverId::new()))
                .await
                .unwrap()
        }

        /// Insert and reconcile like the status queue would.
        async fn insert_load(&self, load: Load) -> Load {
            let load = self.loads.insert(load).await.unwrap();
            let event = ChangeEvent::Insert {
                document_id: load.id,
                version: load.version,
                after: load.clone(),
            };
            self.handler.reconcile(&event).await.unwrap().unwrap()
        }

        /// Apply `patch` and return the update event the store would publish.
        async fn apply(&self, load: &Load, field: &str, patch: Patch) -> ChangeEvent<Load> {
            let before = self.loads.get(load.id).await.unwrap().unwrap();
            let after = self
                .loads
                .update_where(load.id, &[], patch)
                .await
                .unwrap()
                .unwrap();
            ChangeEvent::Update {
                document_id: after.id,
                version: after.version,
                changed_fields: vec![field.to_string()],
                before: Some(before),
                after: Some(after),
            }
        }

        /// Apply `patch` and reconcile the resulting update event.
        async fn change(&self, load: &Load, field: &str, patch: Patch) -> Option<Load> {
            let event = self.apply(load, field, patch).await;
            self.handler.reconcile(&event).await.unwrap()
        }

        async fn load(&self, load: &Load) -> Load {
            self.loads.get(load.id).await.unwrap().unwrap()
        }

        async fn truck_status(&self, truck: &Truck) -> TruckStatus {
            self.trucks.get(truck.id).await.unwrap().unwrap().status
        }

        async fn pushes(&self) -> Vec<Message> {
            self.messages
                .find(&[])
                .await
                .unwrap()
                .into_iter()
                .filter(|m| m.channel() == MessageChannel::Push)
                .collect()
        }
    }

    #[tokio::test]
    async fn unassigned_load_is_available() {
        let f = fixture();
        let load = f.insert_load(Load::new("L-1", stops_at(8))).await;
        assert_eq!(load.status, LoadStatus::Available);
    }

    #[tokio::test]
    async fn first_assignment_starts_load_and_occupies_truck() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;

        assert_eq!(load.status, LoadStatus::InProgress);
        assert_eq!(f.truck_status(&truck).await, TruckStatus::OnRoute);

        let pushes = f.pushes().await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].dedupe_key.as_deref(), Some(in_progress_dedupe_key(&load).as_str()));
    }

    #[tokio::test]
    async fn second_assignment_is_planned() {
        let f = fixture();
        let truck = f.truck().await;
        f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;
        let second = f.insert_load(Load::new("L-2", stops_at(14)).with_truck(truck.id)).await;

        assert_eq!(second.status, LoadStatus::Planned);
        assert_eq!(f.pushes().await.len(), 1);
    }

    #[tokio::test]
    async fn completion_promotes_earliest_planned() {
        let f = fixture();
        let truck = f.truck().await;
        let first = f.insert_load(Load::new("L-1", stops_at(6)).with_truck(truck.id)).await;
        let late = f.insert_load(Load::new("L-3", stops_at(18)).with_truck(truck.id)).await;
        let early = f.insert_load(Load::new("L-2", stops_at(10)).with_truck(truck.id)).await;

        let done = f
            .change(&first, fields::STATUS, Patch::new().set(fields::STATUS, LoadStatus::Completed))
            .await
            .unwrap();
        assert_eq!(done.status, LoadStatus::Completed);

        assert_eq!(f.load(&early).await.status, LoadStatus::InProgress);
        assert_eq!(f.load(&late).await.status, LoadStatus::Planned);
        assert_eq!(f.truck_status(&truck).await, TruckStatus::OnRoute);
        assert_eq!(f.pushes().await.len(), 2);
    }

    #[tokio::test]
    async fn cancelling_last_load_frees_truck() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;

        f.change(&load, fields::STATUS, Patch::new().set(fields::STATUS, LoadStatus::Cancelled))
            .await;
        assert_eq!(f.truck_status(&truck).await, TruckStatus::Available);
    }

    #[tokio::test]
    async fn release_preserves_dispatcher_set_truck_status() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;
        f.trucks
            .update_where(
                truck.id,
                &[],
                Patch::new().set(truck_fields::STATUS, TruckStatus::WillBeAvailable),
            )
            .await
            .unwrap();

        f.change(&load, fields::STATUS, Patch::new().set(fields::STATUS, LoadStatus::Tonu))
            .await;
        assert_eq!(f.truck_status(&truck).await, TruckStatus::WillBeAvailable);
    }

    #[tokio::test]
    async fn all_stops_terminal_completes_and_releases() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;

        let mut stops = load.stops.clone();
        for stop in &mut stops {
            stop.complete();
        }
        assert!(stops.iter().all(|s| s.status != StopStatus::Pending));

        let done = f
            .change(&load, fields::STOPS, Patch::new().set(fields::STOPS, &stops))
            .await
            .unwrap();
        assert_eq!(done.status, LoadStatus::Completed);
        assert_eq!(f.truck_status(&truck).await, TruckStatus::Available);
    }

    #[tokio::test]
    async fn unassigning_running_load_releases_truck() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;

        let load = f
            .change(
                &load,
                fields::TRUCK_ID,
                Patch::new().set(fields::TRUCK_ID, Option::<TruckId>::None),
            )
            .await
            .unwrap();
        assert_eq!(load.status, LoadStatus::Available);
        assert_eq!(f.truck_status(&truck).await, TruckStatus::Available);
    }

    #[tokio::test]
    async fn reassignment_releases_old_truck_first() {
        let f = fixture();
        let (old, new) = (f.truck().await, f.truck().await);
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(old.id)).await;

        let load = f
            .change(&load, fields::TRUCK_ID, Patch::new().set(fields::TRUCK_ID, new.id))
            .await
            .unwrap();
        assert_eq!(load.status, LoadStatus::InProgress);
        assert_eq!(f.truck_status(&old).await, TruckStatus::Available);
        assert_eq!(f.truck_status(&new).await, TruckStatus::OnRoute);
        assert_eq!(f.pushes().await.len(), 2);
    }

    #[tokio::test]
    async fn unassignment_claimed_after_a_later_event_still_frees_truck() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;
        assert_eq!(load.occupied_truck, Some(truck.id));

        let unassigned = f
            .apply(
                &load,
                fields::TRUCK_ID,
                Patch::new().set(fields::TRUCK_ID, Option::<TruckId>::None),
            )
            .await;
        let restopped = f
            .apply(&load, fields::STOPS, Patch::new().set(fields::STOPS, stops_at(9)))
            .await;

        // The later event wins the claim; its snapshot no longer shows the truck.
        let settled = f.handler.reconcile(&restopped).await.unwrap().unwrap();
        assert!(f.handler.reconcile(&unassigned).await.unwrap().is_none());

        assert_eq!(settled.status, LoadStatus::Available);
        assert_eq!(settled.occupied_truck, None);
        assert_eq!(f.truck_status(&truck).await, TruckStatus::Available);
    }

    #[tokio::test]
    async fn reassignment_claimed_after_a_later_event_moves_truck() {
        let f = fixture();
        let (old, new) = (f.truck().await, f.truck().await);
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(old.id)).await;

        let moved = f
            .apply(&load, fields::TRUCK_ID, Patch::new().set(fields::TRUCK_ID, new.id))
            .await;
        let restopped = f
            .apply(&load, fields::STOPS, Patch::new().set(fields::STOPS, stops_at(9)))
            .await;

        let settled = f.handler.reconcile(&restopped).await.unwrap().unwrap();
        assert!(f.handler.reconcile(&moved).await.unwrap().is_none());

        assert_eq!(settled.status, LoadStatus::InProgress);
        assert_eq!(settled.occupied_truck, Some(new.id));
        assert_eq!(f.truck_status(&old).await, TruckStatus::Available);
        assert_eq!(f.truck_status(&new).await, TruckStatus::OnRoute);
        assert_eq!(f.pushes().await.len(), 2);
    }

    #[tokio::test]
    async fn late_occupy_after_release_leaves_truck_available() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;

        f.change(&load, fields::STATUS, Patch::new().set(fields::STATUS, LoadStatus::Completed))
            .await;
        assert_eq!(f.truck_status(&truck).await, TruckStatus::Available);

        // A slow invocation that planned the occupation before the completion.
        f.handler.occupy_truck(load.id, truck.id).await.unwrap();
        assert_eq!(f.truck_status(&truck).await, TruckStatus::Available);
    }

    #[tokio::test]
    async fn occupy_writes_only_over_the_observed_truck_status() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.insert_load(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await;
        f.trucks
            .update_where(
                truck.id,
                &[],
                Patch::new().set(truck_fields::STATUS, TruckStatus::Available),
            )
            .await
            .unwrap();

        f.handler.occupy_truck(load.id, truck.id).await.unwrap();
        let occupied = f.trucks.get(truck.id).await.unwrap().unwrap();
        assert_eq!(occupied.status, TruckStatus::OnRoute);

        // Already on route: no write, no version bump.
        f.handler.occupy_truck(load.id, truck.id).await.unwrap();
        let again = f.trucks.get(truck.id).await.unwrap().unwrap();
        assert_eq!(again.version, occupied.version);
    }

    #[tokio::test]
    async fn racing_starts_converge_on_earliest_load() {
        let f = fixture();
        let truck = f.truck().await;

        // Both loads were written In Progress by handlers that could not see each
        // other; the next reconciliation must demote the later one.
        let early = f
            .loads
            .insert(Load::new("L-1", stops_at(6)).with_truck(truck.id))
            .await
            .unwrap();
        let late = f
            .loads
            .insert(Load::new("L-2", stops_at(12)).with_truck(truck.id))
            .await
            .unwrap();
        for l in [&early, &late] {
            f.loads
                .update_where(l.id, &[], Patch::new().set(fields::STATUS, LoadStatus::InProgress))
                .await
                .unwrap();
        }

        f.handler.resolve_conflict(truck.id).await.unwrap();
        assert_eq!(f.load(&early).await.status, LoadStatus::InProgress);
        let late = f.load(&late).await;
        assert_eq!(late.status, LoadStatus::Planned);
        assert_eq!(late.occupied_truck, None);
    }

    #[tokio::test]
    async fn replayed_event_sends_no_second_push() {
        let f = fixture();
        let truck = f.truck().await;
        let load = f.loads.insert(Load::new("L-1", stops_at(8)).with_truck(truck.id)).await.unwrap();
        let event = ChangeEvent::Insert {
            document_id: load.id,
            version: load.version,
            after: load.clone(),
        };

        assert!(f.handler.reconcile(&event).await.unwrap().is_some());
        assert!(f.handler.reconcile(&event).await.unwrap().is_none());
        assert_eq!(f.pushes().await.len(), 1);
    }
}
