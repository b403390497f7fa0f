//! Entity models the engine reads and mutates through the [`Querier`]
//! interface. These mirror the storage layer's rows, not the wire formats.
//!
//! [`Querier`]: super::querier::Querier

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal numeric primary key. External consumers only ever see the stable
/// string ids; pks are private to the store.
pub type Pk = i64;

/// Lifecycle status of a system, managed by the admin layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    Installing,
    Active,
    InstallFailed,
    Updating,
    UpdateFailed,
    Deleting,
}

#[derive(Clone, Debug, PartialEq)]
pub struct System {
    pub pk: Pk,
    pub id: String,
    pub name: String,
    pub status: SystemStatus,
}

/// How the raw bytes of a feed are to be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParserKind {
    GtfsStatic,
    GtfsRealtime,
}

/// When a feed's periodic update fires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSchedule {
    /// Every `period`, with random startup jitter.
    Periodic { period: Duration },
    /// Once per day at the given wall-clock time.
    Daily {
        hour: u32,
        minute: u32,
        timezone: chrono_tz::Tz,
    },
}

/// A configured data source for a system.
#[derive(Clone, Debug, PartialEq)]
pub struct Feed {
    pub pk: Pk,
    pub system_pk: Pk,
    pub id: String,
    pub url: String,
    pub parser: ParserKind,
    pub auto_update: bool,
    /// `None` means the scheduler's default period applies.
    pub schedule: Option<UpdateSchedule>,
    pub http_timeout: Option<Duration>,
    pub http_headers: Vec<(String, String)>,
}

/// Terminal states are final; only the orchestrator writes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedUpdateStatus {
    Created,
    Success,
    Skipped,
    Failed,
}

/// Immutable audit entry for one update attempt. The pk of the most recent
/// successful update is the freshness watermark for every entity it touched.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedUpdate {
    pub pk: Pk,
    pub feed_pk: Pk,
    pub status: FeedUpdateStatus,
    pub content_hash: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Agency {
    pub pk: Pk,
    pub id: String,
    pub system_pk: Pk,
    pub source_pk: Pk,
    pub name: String,
    pub url: String,
    pub timezone: String,
    pub language: Option<String>,
    pub phone: Option<String>,
    pub fare_url: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub pk: Pk,
    pub id: String,
    pub system_pk: Pk,
    pub source_pk: Pk,
    pub agency_pk: Option<Pk>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub text_color: Option<String>,
    pub route_type: Option<i32>,
}

/// GTFS location types, plus the grouped-station extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopType {
    Platform,
    Station,
    EntranceOrExit,
    GenericNode,
    BoardingArea,
    GroupedStation,
}

impl StopType {
    pub fn from_gtfs_location_type(location_type: i32) -> StopType {
        match location_type {
            1 => StopType::Station,
            2 => StopType::EntranceOrExit,
            3 => StopType::GenericNode,
            4 => StopType::BoardingArea,
            _ => StopType::Platform,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stop {
    pub pk: Pk,
    pub id: String,
    pub system_pk: Pk,
    pub source_pk: Pk,
    pub parent_stop_pk: Option<Pk>,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub stop_type: StopType,
}

impl Stop {
    /// A stop is a station if it is a hierarchy root or explicitly typed as
    /// a (grouped) station. Stations are the unit of aggregation for service
    /// maps and transfers.
    pub fn is_station(&self) -> bool {
        self.parent_stop_pk.is_none()
            || matches!(self.stop_type, StopType::Station | StopType::GroupedStation)
    }
}

/// Transfers have no external identity: they are replaced wholesale on every
/// static update of their feed.
#[derive(Clone, Debug, PartialEq)]
pub struct Transfer {
    pub pk: Pk,
    pub system_pk: Pk,
    pub source_pk: Pk,
    pub from_stop_pk: Pk,
    pub to_stop_pk: Pk,
    pub transfer_type: i32,
    pub min_transfer_time: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trip {
    pub pk: Pk,
    /// External trip id; unique per feed only together with `route_pk`.
    pub id: String,
    pub route_pk: Pk,
    pub source_pk: Pk,
    pub direction: Option<bool>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StopTime {
    pub pk: Pk,
    pub trip_pk: Pk,
    pub stop_pk: Pk,
    pub stop_sequence: i32,
    /// True iff the vehicle has already passed this stop, relative to the
    /// feed's reported position.
    pub past: bool,
    pub arrival_time: Option<i64>,
    pub arrival_delay: Option<i32>,
    pub arrival_uncertainty: Option<i32>,
    pub departure_time: Option<i64>,
    pub departure_delay: Option<i32>,
    pub departure_uncertainty: Option<i32>,
}

/// Which updates regenerate the maps of a config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMapSource {
    Static,
    Realtime,
}

/// Trip predicate for static service maps. A trip contributes edges only if
/// it satisfies every bound that is set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticMapFilter {
    /// Lower-case weekday names; the trip's service must be active on every
    /// listed day.
    #[serde(default)]
    pub days: Option<Vec<String>>,
    /// Bounds on the trip's first departure, in seconds after midnight.
    #[serde(default)]
    pub starts_earlier_than: Option<u32>,
    #[serde(default)]
    pub starts_later_than: Option<u32>,
    /// Bounds on the trip's last arrival, in seconds after midnight.
    #[serde(default)]
    pub ends_earlier_than: Option<u32>,
    #[serde(default)]
    pub ends_later_than: Option<u32>,
}

/// A named policy producing one ordered station list per route.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceMapConfig {
    pub pk: Pk,
    pub system_pk: Pk,
    pub id: String,
    pub source: ServiceMapSource,
    pub static_filter: Option<StaticMapFilter>,
}
