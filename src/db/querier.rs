//! The abstract storage interface. The engine is written against this trait,
//! never against SQL; the production implementation wraps the generated query
//! layer, and [`MemQuerier`](super::mem::MemQuerier) backs the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::*;

#[derive(thiserror::Error, Debug)]
pub enum QuerierError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type QueryResult<T> = Result<T, QuerierError>;

/// Projection of an existing trip used by the realtime updater: the trip row
/// plus its stop times keyed by sequence.
#[derive(Clone, Debug)]
pub struct TripForUpdate {
    pub pk: Pk,
    pub id: String,
    pub route_pk: Pk,
    pub direction: Option<bool>,
    pub stop_times: Vec<ExistingStopTime>,
}

#[derive(Clone, Copy, Debug)]
pub struct ExistingStopTime {
    pub pk: Pk,
    pub stop_pk: Pk,
    pub stop_sequence: i32,
    pub past: bool,
}

/// Parameterized CRUD over the stored entities, scoped by system/feed/route
/// pks. All entity mutation between `begin` and `commit` is atomic: a
/// `rollback` leaves no trace of the update.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn begin(&self) -> QueryResult<()>;
    async fn commit(&self) -> QueryResult<()>;
    async fn rollback(&self) -> QueryResult<()>;

    // Systems and feeds.
    async fn list_systems(&self) -> QueryResult<Vec<System>>;
    async fn get_system(&self, system_id: &str) -> QueryResult<Option<System>>;
    async fn list_feeds(&self, system_pk: Pk) -> QueryResult<Vec<Feed>>;
    async fn get_feed(&self, system_pk: Pk, feed_id: &str) -> QueryResult<Option<Feed>>;

    // Feed updates.
    async fn insert_feed_update(
        &self,
        feed_pk: Pk,
        started_at: DateTime<Utc>,
    ) -> QueryResult<Pk>;
    async fn finish_feed_update(
        &self,
        update_pk: Pk,
        status: FeedUpdateStatus,
        content_hash: Option<String>,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> QueryResult<()>;
    async fn get_feed_update(&self, update_pk: Pk) -> QueryResult<Option<FeedUpdate>>;
    /// Content hash of the feed's most recent successful update, if any.
    async fn last_successful_content_hash(&self, feed_pk: Pk) -> QueryResult<Option<String>>;

    // Agencies.
    async fn map_agency_id_to_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>>;
    async fn insert_agency(&self, agency: Agency) -> QueryResult<Pk>;
    async fn update_agency(&self, agency: Agency) -> QueryResult<()>;
    async fn delete_stale_agencies(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64>;

    // Routes.
    async fn map_route_id_to_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>>;
    async fn list_routes(&self, system_pk: Pk) -> QueryResult<Vec<Route>>;
    async fn insert_route(&self, route: Route) -> QueryResult<Pk>;
    async fn update_route(&self, route: Route) -> QueryResult<()>;
    async fn delete_stale_routes(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64>;

    // Stops.
    async fn map_stop_id_to_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>>;
    /// Maps every stop id to the pk of its owning station, resolving child
    /// stops up the hierarchy.
    async fn map_stop_id_to_station_pk(&self, system_pk: Pk) -> QueryResult<HashMap<String, Pk>>;
    async fn list_stops(&self, system_pk: Pk) -> QueryResult<Vec<Stop>>;
    async fn insert_stop(&self, stop: Stop) -> QueryResult<Pk>;
    async fn update_stop(&self, stop: Stop) -> QueryResult<()>;
    async fn update_stop_parent(&self, stop_pk: Pk, parent_stop_pk: Option<Pk>) -> QueryResult<()>;
    async fn delete_stale_stops(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64>;

    // Transfers.
    async fn insert_transfer(&self, transfer: Transfer) -> QueryResult<Pk>;
    async fn delete_transfers(&self, feed_pk: Pk) -> QueryResult<u64>;

    // Trips and stop times.
    async fn list_trips_for_update(&self, route_pks: &[Pk]) -> QueryResult<Vec<TripForUpdate>>;
    async fn insert_trip(&self, trip: Trip) -> QueryResult<Pk>;
    async fn update_trip(&self, trip: Trip) -> QueryResult<()>;
    async fn delete_stale_trips(&self, feed_pk: Pk, update_pk: Pk) -> QueryResult<u64>;
    async fn insert_stop_time(&self, stop_time: StopTime) -> QueryResult<Pk>;
    async fn update_stop_time(&self, stop_time: StopTime) -> QueryResult<()>;
    async fn delete_stop_times(&self, stop_time_pks: &[Pk]) -> QueryResult<u64>;
    /// Recomputes the past flag for every stop time of the trip:
    /// `past ⇔ stop_sequence < current_sequence`.
    async fn mark_stop_times_past(&self, trip_pk: Pk, current_sequence: i32) -> QueryResult<()>;

    // Service maps.
    async fn list_service_map_configs(&self, system_pk: Pk) -> QueryResult<Vec<ServiceMapConfig>>;
    /// Deletes the previous map for `(config, route)` and stores the new
    /// ordering in one step.
    async fn replace_service_map(
        &self,
        config_pk: Pk,
        route_pk: Pk,
        stop_pks: &[Pk],
    ) -> QueryResult<()>;
    async fn get_service_map(
        &self,
        config_pk: Pk,
        route_pk: Pk,
    ) -> QueryResult<Option<Vec<Pk>>>;
}
