//! End-to-end tests of the update pipeline against the in-memory store.

use std::collections::HashMap;

use chrono::Utc;
use prost::Message;

use transit_engine::db::mem::MemQuerier;
use transit_engine::db::types::{
    FeedUpdateStatus, ParserKind, Pk, ServiceMapSource, StopType,
};
use transit_engine::gtfs::realtime::{
    FeedEntity, FeedHeader, FeedMessage, StopTimeEvent, StopTimeUpdate, TripDescriptor, TripUpdate,
};
use transit_engine::gtfs::static_data::{ParsedRoute, ParsedStop, ParsedStopTime, ParsedTrip, StaticFeed};
use transit_engine::update::static_data::run_static_update;
use transit_engine::{create_and_run_with_content, Querier};

const STATIC_ZIP_V1: &[u8] = include_bytes!("data/gtfs_static_v1.zip");
const STATIC_ZIP_V2: &[u8] = include_bytes!("data/gtfs_static_v2.zip");

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn station(id: &str) -> ParsedStop {
    ParsedStop {
        id: id.to_string(),
        name: Some(id.to_string()),
        latitude: None,
        longitude: None,
        location_type: 1,
        parent_station: None,
    }
}

fn route(id: &str) -> ParsedRoute {
    ParsedRoute {
        id: id.to_string(),
        agency_id: None,
        short_name: Some(id.to_string()),
        long_name: None,
        description: None,
        color: None,
        text_color: None,
        route_type: Some(1),
    }
}

/// Runs a static update directly against the updater, with the audit
/// bookkeeping the orchestrator would do.
async fn apply_static(querier: &MemQuerier, system_pk: Pk, feed_id: &str, parsed: &StaticFeed) -> Pk {
    let feed = querier.get_feed(system_pk, feed_id).await.unwrap().unwrap();
    let update_pk = querier.insert_feed_update(feed.pk, Utc::now()).await.unwrap();
    querier.begin().await.unwrap();
    run_static_update(querier, system_pk, &feed, update_pk, parsed)
        .await
        .unwrap();
    querier.commit().await.unwrap();
    querier
        .finish_feed_update(
            update_pk,
            FeedUpdateStatus::Success,
            Some(format!("hash-{}", update_pk)),
            None,
            Utc::now(),
        )
        .await
        .unwrap();
    update_pk
}

fn trip_entity(
    trip_id: &str,
    route_id: &str,
    direction_id: Option<u32>,
    stops: &[(&str, i64)],
) -> FeedEntity {
    FeedEntity {
        id: trip_id.to_string(),
        is_deleted: None,
        trip_update: Some(TripUpdate {
            trip: Some(TripDescriptor {
                trip_id: Some(trip_id.to_string()),
                start_time: None,
                start_date: None,
                schedule_relationship: None,
                route_id: Some(route_id.to_string()),
                direction_id,
            }),
            stop_time_update: stops
                .iter()
                .map(|&(stop_id, time)| StopTimeUpdate {
                    stop_sequence: None,
                    arrival: Some(StopTimeEvent {
                        delay: None,
                        time: Some(time),
                        uncertainty: None,
                    }),
                    departure: None,
                    stop_id: Some(stop_id.to_string()),
                    schedule_relationship: None,
                })
                .collect(),
            vehicle: None,
            timestamp: None,
            delay: None,
        }),
    }
}

fn rt_payload(timestamp: u64, entities: Vec<FeedEntity>) -> Vec<u8> {
    FeedMessage {
        header: Some(FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            incrementality: Some(0),
            timestamp: Some(timestamp),
        }),
        entity: entities,
    }
    .encode_to_vec()
}

#[tokio::test]
async fn static_zip_updates_end_to_end() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    querier.add_feed(system_pk, "static", "http://example.com/gtfs.zip", ParserKind::GtfsStatic);
    let config_pk = querier.add_service_map_config(system_pk, "alltimes", ServiceMapSource::Static, None);

    let status = create_and_run_with_content(&querier, "nyc", "static", STATIC_ZIP_V1)
        .await
        .unwrap();
    assert_eq!(status, FeedUpdateStatus::Success);

    assert_eq!(querier.agencies().len(), 1);
    assert_eq!(querier.routes().len(), 1);
    assert_eq!(querier.stops().len(), 5);
    assert_eq!(querier.transfers().len(), 1);

    let stations = querier.map_stop_id_to_station_pk(system_pk).await.unwrap();
    let stop_pks: HashMap<String, Pk> = querier.map_stop_id_to_pk(system_pk).await.unwrap();
    assert_eq!(stations["a-n"], stop_pks["stn-a"]);
    assert_eq!(stations["a-s"], stop_pks["stn-a"]);
    assert_eq!(stations["b-n"], stop_pks["stn-b"]);

    let route_pk = querier.routes()[0].pk;
    let map = querier.get_service_map(config_pk, route_pk).await.unwrap();
    assert_eq!(map, Some(vec![stop_pks["stn-a"], stop_pks["stn-b"]]));

    // Unchanged content is skipped without touching entities.
    let status = create_and_run_with_content(&querier, "nyc", "static", STATIC_ZIP_V1)
        .await
        .unwrap();
    assert_eq!(status, FeedUpdateStatus::Skipped);
    assert_eq!(querier.stops().len(), 5);

    // The second version drops the a-s platform and its transfer.
    let status = create_and_run_with_content(&querier, "nyc", "static", STATIC_ZIP_V2)
        .await
        .unwrap();
    assert_eq!(status, FeedUpdateStatus::Success);
    assert_eq!(querier.stops().len(), 4);
    assert!(querier.transfers().is_empty());
    let stations = querier.map_stop_id_to_station_pk(system_pk).await.unwrap();
    assert!(!stations.contains_key("a-s"));
    assert_eq!(stations["a-n"], stop_pks["stn-a"]);

    let statuses: Vec<FeedUpdateStatus> =
        querier.feed_updates().iter().map(|u| u.status).collect();
    assert_eq!(
        statuses,
        vec![
            FeedUpdateStatus::Success,
            FeedUpdateStatus::Skipped,
            FeedUpdateStatus::Success
        ]
    );
}

#[tokio::test]
async fn static_updater_is_idempotent() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    querier.add_feed(system_pk, "static", "http://example.com/gtfs.zip", ParserKind::GtfsStatic);

    let parsed = StaticFeed {
        routes: vec![route("A"), route("B")],
        stops: vec![station("s1"), station("s2")],
        ..Default::default()
    };

    apply_static(&querier, system_pk, "static", &parsed).await;
    let routes_before = querier.routes();
    let stops_before = querier.stops();

    apply_static(&querier, system_pk, "static", &parsed).await;
    let routes_after = querier.routes();
    let stops_after = querier.stops();

    // Same rows, same pks; nothing inserted or deleted.
    assert_eq!(
        routes_before.iter().map(|r| (r.pk, r.id.clone())).collect::<Vec<_>>(),
        routes_after.iter().map(|r| (r.pk, r.id.clone())).collect::<Vec<_>>()
    );
    assert_eq!(
        stops_before.iter().map(|s| (s.pk, s.id.clone())).collect::<Vec<_>>(),
        stops_after.iter().map(|s| (s.pk, s.id.clone())).collect::<Vec<_>>()
    );
}

/// Seeds a route and four stations, the substrate for realtime updates.
async fn seed_static(querier: &MemQuerier, system_pk: Pk) {
    querier.add_feed(system_pk, "static", "http://example.com/gtfs.zip", ParserKind::GtfsStatic);
    let parsed = StaticFeed {
        routes: vec![route("A")],
        stops: vec![station("S1"), station("S2"), station("S3"), station("S4")],
        trips: vec![ParsedTrip {
            id: "sched-1".to_string(),
            route_id: "A".to_string(),
            service_id: "wk".to_string(),
            direction: Some(true),
            stop_times: ["S1", "S2", "S3", "S4"]
                .iter()
                .enumerate()
                .map(|(i, stop_id)| ParsedStopTime {
                    stop_id: stop_id.to_string(),
                    stop_sequence: i as u32 + 1,
                    arrival_time: None,
                    departure_time: None,
                })
                .collect(),
        }],
        ..Default::default()
    };
    apply_static(querier, system_pk, "static", &parsed).await;
}

#[tokio::test]
async fn realtime_past_future_boundary() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    seed_static(&querier, system_pk).await;
    querier.add_feed(system_pk, "rt", "http://example.com/rt", ParserKind::GtfsRealtime);
    let stop_pks = querier.map_stop_id_to_pk(system_pk).await.unwrap();

    // First cycle: three stops ahead, no sequence numbers in the payload.
    let payload = rt_payload(
        100,
        vec![trip_entity("t1", "A", Some(1), &[("S1", 5), ("S2", 10), ("S3", 20)])],
    );
    let status = create_and_run_with_content(&querier, "nyc", "rt", &payload)
        .await
        .unwrap();
    assert_eq!(status, FeedUpdateStatus::Success);

    let trip_pk = querier.trips().iter().find(|t| t.id == "t1").unwrap().pk;
    let stop_times = querier.stop_times_for_trip(trip_pk);
    assert_eq!(stop_times.len(), 3);
    assert!(stop_times.iter().all(|st| !st.past));
    let s3_pk_before = stop_times[2].pk;

    // Second cycle: the vehicle is at S3 and S4 was appended.
    let payload = rt_payload(200, vec![trip_entity("t1", "A", Some(1), &[("S3", 20), ("S4", 30)])]);
    let status = create_and_run_with_content(&querier, "nyc", "rt", &payload)
        .await
        .unwrap();
    assert_eq!(status, FeedUpdateStatus::Success);

    let stop_times = querier.stop_times_for_trip(trip_pk);
    assert_eq!(stop_times.len(), 4);

    assert_eq!(stop_times[0].stop_pk, stop_pks["S1"]);
    assert!(stop_times[0].past);
    assert_eq!(stop_times[1].stop_pk, stop_pks["S2"]);
    assert!(stop_times[1].past);

    // S3 was updated in place, keeping its row identity.
    assert_eq!(stop_times[2].pk, s3_pk_before);
    assert_eq!(stop_times[2].stop_pk, stop_pks["S3"]);
    assert!(!stop_times[2].past);
    assert_eq!(stop_times[2].arrival_time, Some(20));

    assert_eq!(stop_times[3].stop_pk, stop_pks["S4"]);
    assert!(!stop_times[3].past);
    assert_eq!(stop_times[3].arrival_time, Some(30));
}

#[tokio::test]
async fn realtime_trips_absent_from_the_payload_are_deleted() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    seed_static(&querier, system_pk).await;
    querier.add_feed(system_pk, "rt", "http://example.com/rt", ParserKind::GtfsRealtime);

    let payload = rt_payload(
        100,
        vec![
            trip_entity("t1", "A", Some(1), &[("S1", 5)]),
            trip_entity("t2", "A", Some(1), &[("S2", 10)]),
        ],
    );
    create_and_run_with_content(&querier, "nyc", "rt", &payload)
        .await
        .unwrap();
    assert_eq!(querier.trips().len(), 2);

    let payload = rt_payload(200, vec![trip_entity("t2", "A", Some(1), &[("S3", 20)])]);
    create_and_run_with_content(&querier, "nyc", "rt", &payload)
        .await
        .unwrap();

    let trips = querier.trips();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].id, "t2");
}

#[tokio::test]
async fn realtime_service_map_reverses_opposite_direction_trips() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    seed_static(&querier, system_pk).await;
    querier.add_feed(system_pk, "rt", "http://example.com/rt", ParserKind::GtfsRealtime);
    let config_pk = querier.add_service_map_config(system_pk, "realtime", ServiceMapSource::Realtime, None);
    let stop_pks = querier.map_stop_id_to_pk(system_pk).await.unwrap();

    // Direction 0 trip visits the stations backwards.
    let payload = rt_payload(
        100,
        vec![trip_entity("t1", "A", Some(0), &[("S3", 5), ("S2", 10), ("S1", 20)])],
    );
    create_and_run_with_content(&querier, "nyc", "rt", &payload)
        .await
        .unwrap();

    let route_pk = querier.routes()[0].pk;
    let map = querier.get_service_map(config_pk, route_pk).await.unwrap();
    assert_eq!(
        map,
        Some(vec![stop_pks["S1"], stop_pks["S2"], stop_pks["S3"]])
    );
}

#[tokio::test]
async fn failed_update_is_recorded_and_rolls_back() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    seed_static(&querier, system_pk).await;
    querier.add_feed(system_pk, "rt", "http://example.com/rt", ParserKind::GtfsRealtime);

    let payload = rt_payload(100, vec![trip_entity("t1", "A", Some(1), &[("S1", 5)])]);
    create_and_run_with_content(&querier, "nyc", "rt", &payload)
        .await
        .unwrap();
    let trips_before = querier.trips();

    let result = create_and_run_with_content(&querier, "nyc", "rt", &[0xFF, 0xFE, 0x01]).await;
    assert!(result.is_err());

    let last = querier.feed_updates().last().cloned().unwrap();
    assert_eq!(last.status, FeedUpdateStatus::Failed);
    assert!(last.error_message.is_some());
    assert_eq!(querier.trips(), trips_before);

    // Empty content is also a failure, not a skip.
    let result = create_and_run_with_content(&querier, "nyc", "rt", &[]).await;
    assert!(result.is_err());
    let last = querier.feed_updates().last().cloned().unwrap();
    assert_eq!(last.status, FeedUpdateStatus::Failed);
}

#[tokio::test]
async fn cyclic_trip_data_preserves_the_previous_service_map() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    querier.add_feed(system_pk, "static", "http://example.com/gtfs.zip", ParserKind::GtfsStatic);
    let config_pk = querier.add_service_map_config(system_pk, "alltimes", ServiceMapSource::Static, None);

    let stop_times = |ids: &[&str]| -> Vec<ParsedStopTime> {
        ids.iter()
            .enumerate()
            .map(|(i, stop_id)| ParsedStopTime {
                stop_id: stop_id.to_string(),
                stop_sequence: i as u32 + 1,
                arrival_time: None,
                departure_time: None,
            })
            .collect()
    };
    let trip = |id: &str, ids: &[&str]| ParsedTrip {
        id: id.to_string(),
        route_id: "A".to_string(),
        service_id: "wk".to_string(),
        direction: Some(true),
        stop_times: stop_times(ids),
    };

    let good = StaticFeed {
        routes: vec![route("A")],
        stops: vec![station("a"), station("b"), station("c")],
        trips: vec![trip("t1", &["a", "b", "c"])],
        ..Default::default()
    };
    apply_static(&querier, system_pk, "static", &good).await;

    let stop_pks = querier.map_stop_id_to_pk(system_pk).await.unwrap();
    let route_pk = querier.routes()[0].pk;
    let expected = vec![stop_pks["a"], stop_pks["b"], stop_pks["c"]];
    assert_eq!(
        querier.get_service_map(config_pk, route_pk).await.unwrap(),
        Some(expected.clone())
    );

    // Contradictory trips make the station graph cyclic; the map survives.
    let cyclic = StaticFeed {
        routes: vec![route("A")],
        stops: vec![station("a"), station("b"), station("c")],
        trips: vec![trip("t1", &["a", "b"]), trip("t2", &["b", "a"])],
        ..Default::default()
    };
    apply_static(&querier, system_pk, "static", &cyclic).await;
    assert_eq!(
        querier.get_service_map(config_pk, route_pk).await.unwrap(),
        Some(expected)
    );
}

#[tokio::test]
async fn stop_hierarchy_links_survive_restructuring() {
    init();
    let querier = MemQuerier::new();
    let system_pk = querier.add_system("nyc");
    querier.add_feed(system_pk, "static", "http://example.com/gtfs.zip", ParserKind::GtfsStatic);

    let platform = |id: &str, parent: &str| ParsedStop {
        id: id.to_string(),
        name: None,
        latitude: None,
        longitude: None,
        location_type: 0,
        parent_station: Some(parent.to_string()),
    };

    let v1 = StaticFeed {
        stops: vec![station("A"), platform("B", "A"), platform("C", "A")],
        ..Default::default()
    };
    apply_static(&querier, system_pk, "static", &v1).await;
    let stations = querier.map_stop_id_to_station_pk(system_pk).await.unwrap();
    let a_pk = querier.map_stop_id_to_pk(system_pk).await.unwrap()["A"];
    assert_eq!(stations["B"], a_pk);
    assert_eq!(stations["C"], a_pk);

    // C disappears; B moves with no change.
    let v2 = StaticFeed {
        stops: vec![station("A"), platform("B", "A")],
        ..Default::default()
    };
    apply_static(&querier, system_pk, "static", &v2).await;
    let stations = querier.map_stop_id_to_station_pk(system_pk).await.unwrap();
    assert_eq!(stations.len(), 2);
    assert_eq!(stations["A"], a_pk);
    assert_eq!(stations["B"], a_pk);

    let stop_types: Vec<StopType> = querier.stops().iter().map(|s| s.stop_type).collect();
    assert_eq!(stop_types.len(), 2);
}
