//! GTFS-realtime wire messages and their conversion into the engine's
//! realtime feed model.
//!
//! The message structs correspond to gtfs-realtime.proto, trimmed to the
//! fields the engine consumes and kept in-tree (with the upstream field
//! tags) instead of being generated at build time.

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

#[derive(thiserror::Error, Debug)]
pub enum RealtimeParseError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type RealtimeParseResult<T> = Result<T, RealtimeParseError>;

#[derive(Clone, PartialEq, Message)]
pub struct FeedMessage {
    #[prost(message, optional, tag = "1")]
    pub header: Option<FeedHeader>,
    #[prost(message, repeated, tag = "2")]
    pub entity: Vec<FeedEntity>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FeedHeader {
    #[prost(string, tag = "1")]
    pub gtfs_realtime_version: String,
    #[prost(int32, optional, tag = "2")]
    pub incrementality: Option<i32>,
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FeedEntity {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, optional, tag = "2")]
    pub is_deleted: Option<bool>,
    #[prost(message, optional, tag = "3")]
    pub trip_update: Option<TripUpdate>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TripUpdate {
    #[prost(message, optional, tag = "1")]
    pub trip: Option<TripDescriptor>,
    #[prost(message, repeated, tag = "2")]
    pub stop_time_update: Vec<StopTimeUpdate>,
    #[prost(message, optional, tag = "3")]
    pub vehicle: Option<VehicleDescriptor>,
    #[prost(uint64, optional, tag = "4")]
    pub timestamp: Option<u64>,
    #[prost(int32, optional, tag = "5")]
    pub delay: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TripDescriptor {
    #[prost(string, optional, tag = "1")]
    pub trip_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub start_time: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub start_date: Option<String>,
    #[prost(int32, optional, tag = "4")]
    pub schedule_relationship: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub route_id: Option<String>,
    #[prost(uint32, optional, tag = "6")]
    pub direction_id: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StopTimeUpdate {
    #[prost(uint32, optional, tag = "1")]
    pub stop_sequence: Option<u32>,
    #[prost(message, optional, tag = "2")]
    pub arrival: Option<StopTimeEvent>,
    #[prost(message, optional, tag = "3")]
    pub departure: Option<StopTimeEvent>,
    #[prost(string, optional, tag = "4")]
    pub stop_id: Option<String>,
    #[prost(int32, optional, tag = "5")]
    pub schedule_relationship: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StopTimeEvent {
    #[prost(int32, optional, tag = "1")]
    pub delay: Option<i32>,
    #[prost(int64, optional, tag = "2")]
    pub time: Option<i64>,
    #[prost(int32, optional, tag = "3")]
    pub uncertainty: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VehicleDescriptor {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub label: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub license_plate: Option<String>,
}

// Engine-facing model, decoupled from the wire format.

#[derive(Clone, Debug, Default)]
pub struct RealtimeFeed {
    pub timestamp: Option<DateTime<Utc>>,
    pub trips: Vec<RealtimeTrip>,
}

#[derive(Clone, Debug)]
pub struct RealtimeTrip {
    pub id: String,
    pub route_id: Option<String>,
    pub direction: Option<bool>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    /// In payload order; sequences are reconciled by the realtime updater.
    pub stop_times: Vec<RealtimeStopTime>,
}

#[derive(Clone, Debug, Default)]
pub struct RealtimeStopTime {
    pub stop_id: Option<String>,
    pub stop_sequence: Option<i32>,
    pub arrival: Option<RealtimeEvent>,
    pub departure: Option<RealtimeEvent>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RealtimeEvent {
    pub time: Option<i64>,
    pub delay: Option<i32>,
    pub uncertainty: Option<i32>,
}

impl From<StopTimeEvent> for RealtimeEvent {
    fn from(event: StopTimeEvent) -> Self {
        RealtimeEvent {
            time: event.time,
            delay: event.delay,
            uncertainty: event.uncertainty,
        }
    }
}

/// Decodes a protobuf GTFS-realtime payload. Entities without a trip update
/// or without a trip id carry nothing the engine stores and are dropped.
pub fn parse_realtime(bytes: &[u8]) -> RealtimeParseResult<RealtimeFeed> {
    let message = FeedMessage::decode(bytes)?;

    let timestamp = message
        .header
        .and_then(|h| h.timestamp)
        .and_then(|t| Utc.timestamp_opt(t as i64, 0).single());

    let mut trips = Vec::new();
    for entity in message.entity {
        let Some(update) = entity.trip_update else {
            continue;
        };
        let Some(descriptor) = update.trip else {
            continue;
        };
        let Some(trip_id) = descriptor.trip_id.filter(|id| !id.is_empty()) else {
            log::debug!("Dropping trip update without a trip id: {}", entity.id);
            continue;
        };

        let stop_times = update
            .stop_time_update
            .into_iter()
            .map(|stu| RealtimeStopTime {
                stop_id: stu.stop_id,
                stop_sequence: stu.stop_sequence.map(|s| s as i32),
                arrival: stu.arrival.map(RealtimeEvent::from),
                departure: stu.departure.map(RealtimeEvent::from),
            })
            .collect();

        trips.push(RealtimeTrip {
            id: trip_id,
            route_id: descriptor.route_id,
            direction: descriptor.direction_id.map(|d| d != 0),
            vehicle_id: update.vehicle.as_ref().and_then(|v| v.id.clone()),
            vehicle_label: update.vehicle.as_ref().and_then(|v| v.label.clone()),
            stop_times,
        });
    }

    Ok(RealtimeFeed { timestamp, trips })
}
