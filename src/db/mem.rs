//! In-memory [`Querier`] implementation. Used as the reference store in
//! tests and by embedders that do not need persistence. Transactions are
//! snapshot based: `begin` clones the state, `rollback` restores it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::querier::{ExistingStopTime, Querier, QuerierError, QueryResult, TripForUpdate};
use super::types::*;

#[derive(Clone, Debug, Default)]
struct State {
    systems: Vec<System>,
    feeds: Vec<Feed>,
    updates: Vec<FeedUpdate>,
    agencies: Vec<Agency>,
    routes: Vec<Route>,
    stops: Vec<Stop>,
    transfers: Vec<Transfer>,
    trips: Vec<Trip>,
    stop_times: Vec<StopTime>,
    configs: Vec<ServiceMapConfig>,
    service_maps: HashMap<(Pk, Pk), Vec<Pk>>,
    next_pk: Pk,
}

impl State {
    fn allocate_pk(&mut self) -> Pk {
        self.next_pk += 1;
        self.next_pk
    }

    /// The feed an update row belongs to.
    fn update_feed_pk(&self, update_pk: Pk) -> Option<Pk> {
        self.updates
            .iter()
            .find(|u| u.pk == update_pk)
            .map(|u| u.feed_pk)
    }

    fn is_stale(&self, source_pk: Pk, feed_pk: Pk, update_pk: Pk) -> bool {
        self.update_feed_pk(source_pk) == Some(feed_pk) && source_pk != update_pk
    }

    fn delete_trips(&mut self, trip_pks: &HashSet<Pk>) {
        self.stop_times.retain(|st| !trip_pks.contains(&st.trip_pk));
        self.trips.retain(|t| !trip_pks.contains(&t.pk));
    }

    fn delete_stops_cascading(&mut self, stop_pks: &HashSet<Pk>) {
        self.stops.retain(|s| !stop_pks.contains(&s.pk));
        for stop in &mut self.stops {
            if let Some(parent) = stop.parent_stop_pk {
                if stop_pks.contains(&parent) {
                    stop.parent_stop_pk = None;
                }
            }
        }
        self.transfers
            .retain(|t| !stop_pks.contains(&t.from_stop_pk) && !stop_pks.contains(&t.to_stop_pk));
        self.stop_times.retain(|st| !stop_pks.contains(&st.stop_pk));
    }

    fn station_pk(&self, stop: &Stop) -> Pk {
        let by_pk: HashMap<Pk, &Stop> = self.stops.iter().map(|s| (s.pk, s)).collect();
        let mut current = stop;
        let mut visited = HashSet::new();
        while !current.is_station() && visited.insert(current.pk) {
            match current.parent_stop_pk.and_then(|pk| by_pk.get(&pk)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current.pk
    }
}

#[derive(Default)]
pub struct MemQuerier {
    state: Mutex<State>,
    snapshot: Mutex<Option<State>>,
}

impl MemQuerier {
    pub fn new() -> Self {
        MemQuerier::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    // Seeding helpers for the admin-layer entities the engine itself never
    // creates.

    pub fn add_system(&self, id: &str) -> Pk {
        self.with(|s| {
            let pk = s.allocate_pk();
            s.systems.push(System {
                pk,
                id: id.to_string(),
                name: id.to_string(),
                status: SystemStatus::Active,
            });
            pk
        })
    }

    pub fn add_feed(&self, system_pk: Pk, id: &str, url: &str, parser: ParserKind) -> Pk {
        self.with(|s| {
            let pk = s.allocate_pk();
            s.feeds.push(Feed {
                pk,
                system_pk,
                id: id.to_string(),
                url: url.to_string(),
                parser,
                auto_update: true,
                schedule: None,
                http_timeout: Some(Duration::from_secs(30)),
                http_headers: Vec::new(),
            });
            pk
        })
    }

    pub fn set_feed_schedule(&self, feed_pk: Pk, schedule: Option<UpdateSchedule>) {
        self.with(|s| {
            if let Some(feed) = s.feeds.iter_mut().find(|f| f.pk == feed_pk) {
                feed.schedule = schedule;
            }
        });
    }

    pub fn remove_feed(&self, feed_pk: Pk) {
        self.with(|s| s.feeds.retain(|f| f.pk != feed_pk));
    }

    pub fn add_service_map_config(
        &self,
        system_pk: Pk,
        id: &str,
        source: ServiceMapSource,
        static_filter: Option<StaticMapFilter>,
    ) -> Pk {
        self.with(|s| {
            let pk = s.allocate_pk();
            s.configs.push(ServiceMapConfig {
                pk,
                system_pk,
                id: id.to_string(),
                source,
                static_filter,
            });
            pk
        })
    }

    // Inspection helpers for tests.

    pub fn agencies(&self) -> Vec<Agency> {
        self.with(|s| s.agencies.clone())
    }

    pub fn routes(&self) -> Vec<Route> {
        self.with(|s| s.routes.clone())
    }

    pub fn stops(&self) -> Vec<Stop> {
        self.with(|s| s.stops.clone())
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.with(|s| s.transfers.clone())
    }

    pub fn trips(&self) -> Vec<Trip> {
        self.with(|s| s.trips.clone())
    }

    pub fn stop_times_for_trip(&self, trip_pk: Pk) -> Vec<StopTime> {
        self.with(|s| {
            let mut times: Vec<StopTime> = s
                .stop_times
                .iter()
                .filter(|st| st.trip_pk == trip_pk)
                .cloned()
                .collect();
            times.sort_by_key(|st| st.stop_sequence);
            times
        })
    }

    pub fn feed_updates(&self) -> Vec<FeedUpdate> {
        self.with(|s| s.updates.clone())
    }
}

#[async_trait]
impl Querier for MemQuerier {
    async fn begin(&self) -> QueryResult<()> {
        let mut snapshot = self.snapshot.lock().unwrap();
        if snapshot.is_some() {
            return Err(QuerierError::Constraint(
                "transaction already in progress".to_string(),
            ));
        }
        *snapshot = Some(self.state.lock().unwrap().clone());
        Ok(())
    }

    async fn commit(&self) -> QueryResult<()> {
        self.snapshot.lock().unwrap().take();
        Ok(())
    }

    async fn rollback(&self) -> QueryResult<()> {
        if let Some(saved) = self.snapshot.lock().unwrap().take() {
            *self.state.lock().unwrap() = saved;
        }
        Ok(())
    }

    async fn list_systems(&self) -> QueryResult<Vec<System>> {
        Ok(self.with(|s| s.systems.clone()))
    }

    async fn get_system(&self, system_id: &str) -> QueryResult<Option<System>> {
        Ok(self.with(|s| s.systems.iter().find(|sys| sys.id == system_id).cloned()))
    }

    async fn list_feeds(&self, system_pk: Pk) -> QueryResult<Vec<Feed>> {
        Ok(self.with(|s| {
            s.feeds
                .iter()
                .filter(|f| f.system_pk == system_pk)
                .cloned()
                .collect()
        }))
    }

    async fn get_feed(&self, system_pk: Pk, feed_id: &str) -> QueryResult<Option<Feed>> {
        Ok(self.with(|s| {
            s.feeds
                .iter()
                .find(|f| f.system_pk == system_pk && f.id == feed_id)
                .cloned()
        }))
    }

    async fn insert_feed_update(&self, feed_pk: Pk, started_at: DateTime<Utc>) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            let pk = s.allocate_pk();
            s.updates.push(FeedUpdate {
                pk,
                feed_pk,
                status: FeedUpdateStatus::Created,
                content_hash: None,
                error_message: None,
                started_at,
                finished_at: None,
            });
            pk
        }))
    }

    async fn finish_feed_update(
        &self,
        update_pk: Pk,
        status: FeedUpdateStatus,
        content_hash: Option<String>,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> QueryResult<()> {
        self.with(|s| {
            let update = s
                .updates
                .iter_mut()
                .find(|u| u.pk == update_pk)
                .ok_or_else(|| QuerierError::NotFound(format!("feed update {}", update_pk)))?;
            if update.status != FeedUpdateStatus::Created {
                return Err(QuerierError::Constraint(format!(
                    "feed update {} is already terminal",
                    update_pk
                )));
            }
            update.status = status;
            update.content_hash = content_hash;
            update.error_message = error_message;
            update.finished_at = Some(finished_at);
            Ok(())
        })
    }

    async fn get_feed_update(&self, update_pk: Pk) -> QueryResult<Option<FeedUpdate>> {
        Ok(self.with(|s| s.updates.iter().find(|u| u.pk == update_pk).cloned()))
    }

    async fn last_successful_content_hash(&self, feed_pk: Pk) -> QueryResult<Option<String>> {
        Ok(self.with(|s| {
            s.updates
                .iter()
                .rev()
                .find(|u| u.feed_pk == feed_pk && u.status == FeedUpdateStatus::Success)
                .and_then(|u| u.content_hash.clone())
        }))
    }

    async fn map_agency_id_to_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>> {
        Ok(self.with(|s| {
            s.agencies
                .iter()
                .filter(|a| a.system_pk == system_pk)
                .map(|a| (a.id.clone(), a.pk))
                .collect()
        }))
    }

    async fn insert_agency(&self, mut agency: Agency) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            agency.pk = s.allocate_pk();
            let pk = agency.pk;
            s.agencies.push(agency);
            pk
        }))
    }

    async fn update_agency(&self, agency: Agency) -> QueryResult<()> {
        self.with(|s| {
            let existing = s
                .agencies
                .iter_mut()
                .find(|a| a.pk == agency.pk)
                .ok_or_else(|| QuerierError::NotFound(format!("agency {}", agency.pk)))?;
            *existing = agency;
            Ok(())
        })
    }

    async fn delete_stale_agencies(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64> {
        Ok(self.with(|s| {
            let stale: HashSet<Pk> = s
                .agencies
                .iter()
                .filter(|a| s.is_stale(a.source_pk, feed_pk, update_pk))
                .map(|a| a.pk)
                .collect();
            for route in &mut s.routes {
                if let Some(agency_pk) = route.agency_pk {
                    if stale.contains(&agency_pk) {
                        route.agency_pk = None;
                    }
                }
            }
            s.agencies.retain(|a| !stale.contains(&a.pk));
            stale.len() as u64
        }))
    }

    async fn map_route_id_to_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>> {
        Ok(self.with(|s| {
            s.routes
                .iter()
                .filter(|r| r.system_pk == system_pk)
                .map(|r| (r.id.clone(), r.pk))
                .collect()
        }))
    }

    async fn list_routes(&self, system_pk: Pk) -> QueryResult<Vec<Route>> {
        Ok(self.with(|s| {
            s.routes
                .iter()
                .filter(|r| r.system_pk == system_pk)
                .cloned()
                .collect()
        }))
    }

    async fn insert_route(&self, mut route: Route) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            route.pk = s.allocate_pk();
            let pk = route.pk;
            s.routes.push(route);
            pk
        }))
    }

    async fn update_route(&self, route: Route) -> QueryResult<()> {
        self.with(|s| {
            let existing = s
                .routes
                .iter_mut()
                .find(|r| r.pk == route.pk)
                .ok_or_else(|| QuerierError::NotFound(format!("route {}", route.pk)))?;
            *existing = route;
            Ok(())
        })
    }

    async fn delete_stale_routes(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64> {
        Ok(self.with(|s| {
            let stale: HashSet<Pk> = s
                .routes
                .iter()
                .filter(|r| s.is_stale(r.source_pk, feed_pk, update_pk))
                .map(|r| r.pk)
                .collect();
            let orphan_trips: HashSet<Pk> = s
                .trips
                .iter()
                .filter(|t| stale.contains(&t.route_pk))
                .map(|t| t.pk)
                .collect();
            s.delete_trips(&orphan_trips);
            s.service_maps.retain(|(_, route_pk), _| !stale.contains(route_pk));
            s.routes.retain(|r| !stale.contains(&r.pk));
            stale.len() as u64
        }))
    }

    async fn map_stop_id_to_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>> {
        Ok(self.with(|s| {
            s.stops
                .iter()
                .filter(|st| st.system_pk == system_pk)
                .map(|st| (st.id.clone(), st.pk))
                .collect()
        }))
    }

    async fn map_stop_id_to_station_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>> {
        Ok(self.with(|s| {
            s.stops
                .iter()
                .filter(|st| st.system_pk == system_pk)
                .map(|st| (st.id.clone(), s.station_pk(st)))
                .collect()
        }))
    }

    async fn list_stops(&self, system_pk: Pk) -> QueryResult<Vec<Stop>> {
        Ok(self.with(|s| {
            s.stops
                .iter()
                .filter(|st| st.system_pk == system_pk)
                .cloned()
                .collect()
        }))
    }

    async fn insert_stop(&self, mut stop: Stop) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            stop.pk = s.allocate_pk();
            let pk = stop.pk;
            s.stops.push(stop);
            pk
        }))
    }

    async fn update_stop(&self, stop: Stop) -> QueryResult<()> {
        self.with(|s| {
            let existing = s
                .stops
                .iter_mut()
                .find(|st| st.pk == stop.pk)
                .ok_or_else(|| QuerierError::NotFound(format!("stop {}", stop.pk)))?;
            *existing = stop;
            Ok(())
        })
    }

    async fn update_stop_parent(&self, stop_pk: Pk, parent_stop_pk: Option<Pk>) -> QueryResult<()> {
        self.with(|s| {
            let existing = s
                .stops
                .iter_mut()
                .find(|st| st.pk == stop_pk)
                .ok_or_else(|| QuerierError::NotFound(format!("stop {}", stop_pk)))?;
            existing.parent_stop_pk = parent_stop_pk;
            Ok(())
        })
    }

    async fn delete_stale_stops(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64> {
        Ok(self.with(|s| {
            let stale: HashSet<Pk> = s
                .stops
                .iter()
                .filter(|st| s.is_stale(st.source_pk, feed_pk, update_pk))
                .map(|st| st.pk)
                .collect();
            s.delete_stops_cascading(&stale);
            stale.len() as u64
        }))
    }

    async fn insert_transfer(&self, mut transfer: Transfer) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            transfer.pk = s.allocate_pk();
            let pk = transfer.pk;
            s.transfers.push(transfer);
            pk
        }))
    }

    async fn delete_transfers(&self, feed_pk: Pk) -> QueryResult<u64> {
        Ok(self.with(|s| {
            let doomed: HashSet<Pk> = s
                .transfers
                .iter()
                .filter(|t| s.update_feed_pk(t.source_pk) == Some(feed_pk))
                .map(|t| t.pk)
                .collect();
            s.transfers.retain(|t| !doomed.contains(&t.pk));
            doomed.len() as u64
        }))
    }

    async fn list_trips_for_update(&self, route_pks: &[Pk]) -> QueryResult<Vec<TripForUpdate>> {
        Ok(self.with(|s| {
            let wanted: HashSet<Pk> = route_pks.iter().copied().collect();
            s.trips
                .iter()
                .filter(|t| wanted.contains(&t.route_pk))
                .map(|t| {
                    let mut stop_times: Vec<ExistingStopTime> = s
                        .stop_times
                        .iter()
                        .filter(|st| st.trip_pk == t.pk)
                        .map(|st| ExistingStopTime {
                            pk: st.pk,
                            stop_pk: st.stop_pk,
                            stop_sequence: st.stop_sequence,
                            past: st.past,
                        })
                        .collect();
                    stop_times.sort_by_key(|st| st.stop_sequence);
                    TripForUpdate {
                        pk: t.pk,
                        id: t.id.clone(),
                        route_pk: t.route_pk,
                        direction: t.direction,
                        stop_times,
                    }
                })
                .collect()
        }))
    }

    async fn insert_trip(&self, mut trip: Trip) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            trip.pk = s.allocate_pk();
            let pk = trip.pk;
            s.trips.push(trip);
            pk
        }))
    }

    async fn update_trip(&self, trip: Trip) -> QueryResult<()> {
        self.with(|s| {
            let existing = s
                .trips
                .iter_mut()
                .find(|t| t.pk == trip.pk)
                .ok_or_else(|| QuerierError::NotFound(format!("trip {}", trip.pk)))?;
            *existing = trip;
            Ok(())
        })
    }

    async fn delete_stale_trips(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64> {
        Ok(self.with(|s| {
            let stale: HashSet<Pk> = s
                .trips
                .iter()
                .filter(|t| s.is_stale(t.source_pk, feed_pk, update_pk))
                .map(|t| t.pk)
                .collect();
            s.delete_trips(&stale);
            stale.len() as u64
        }))
    }

    async fn insert_stop_time(&self, mut stop_time: StopTime) -> QueryResult<Pk> {
        Ok(self.with(|s| {
            stop_time.pk = s.allocate_pk();
            let pk = stop_time.pk;
            s.stop_times.push(stop_time);
            pk
        }))
    }

    async fn update_stop_time(&self, stop_time: StopTime) -> QueryResult<()> {
        self.with(|s| {
            let existing = s
                .stop_times
                .iter_mut()
                .find(|st| st.pk == stop_time.pk)
                .ok_or_else(|| QuerierError::NotFound(format!("stop time {}", stop_time.pk)))?;
            *existing = stop_time;
            Ok(())
        })
    }

    async fn delete_stop_times(&self, stop_time_pks: &[Pk]) -> QueryResult<u64> {
        Ok(self.with(|s| {
            let doomed: HashSet<Pk> = stop_time_pks.iter().copied().collect();
            let before = s.stop_times.len();
            s.stop_times.retain(|st| !doomed.contains(&st.pk));
            (before - s.stop_times.len()) as u64
        }))
    }

    async fn mark_stop_times_past(&self, trip_pk: Pk, current_sequence: i32) -> QueryResult<()> {
        self.with(|s| {
            for st in s.stop_times.iter_mut().filter(|st| st.trip_pk == trip_pk) {
                st.past = st.stop_sequence < current_sequence;
            }
            Ok(())
        })
    }

    async fn list_service_map_configs(&self, system_pk: Pk) -> QueryResult<Vec<ServiceMapConfig>> {
        Ok(self.with(|s| {
            s.configs
                .iter()
                .filter(|c| c.system_pk == system_pk)
                .cloned()
                .collect()
        }))
    }

    async fn replace_service_map(
        &self,
        config_pk: Pk,
        route_pk: Pk,
        stop_pks: &[Pk],
    ) -> QueryResult<()> {
        self.with(|s| {
            s.service_maps
                .insert((config_pk, route_pk), stop_pks.to_vec());
            Ok(())
        })
    }

    async fn get_service_map(&self, config_pk: Pk, route_pk: Pk) -> QueryResult<Option<Vec<Pk>>> {
        Ok(self.with(|s| s.service_maps.get(&(config_pk, route_pk)).cloned()))
    }
}
