//! Derives the canonical ordered list of stations each route visits, from
//! observed trip stop sequences, via topological sort.
//!
//! Maps are regenerated wholesale. If a day's data produces a cyclic station
//! graph the route keeps its previous map: inconsistent input must never
//! erase a good map.

use std::collections::{HashMap, HashSet};

use chrono::Weekday;

use crate::db::querier::{Querier, QueryResult};
use crate::db::types::{Pk, ServiceMapSource, StaticMapFilter, Stop};
use crate::graph::Graph;
use crate::gtfs::static_data::{ParsedService, ParsedTrip, StaticFeed};

/// Rebuilds every static-source service map of the system from the parsed
/// feed. Called at the end of each static update, inside its transaction.
pub async fn update_static_maps(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &StaticFeed,
    route_id_to_pk: &HashMap<String, Pk>,
) -> QueryResult<()> {
    let configs: Vec<_> = querier
        .list_service_map_configs(system_pk)
        .await?
        .into_iter()
        .filter(|c| c.source == ServiceMapSource::Static)
        .collect();
    if configs.is_empty() {
        return Ok(());
    }

    let station_by_stop_id = querier.map_stop_id_to_station_pk(system_pk).await?;

    for config in configs {
        let mut sequences_by_route: HashMap<Pk, Vec<Vec<Pk>>> = HashMap::new();
        for trip in &feed.trips {
            let Some(&route_pk) = route_id_to_pk.get(&trip.route_id) else {
                continue;
            };
            if !trip_matches_filter(trip, &feed.services, config.static_filter.as_ref()) {
                continue;
            }
            let stations = station_sequence(
                trip.stop_times.iter().map(|st| st.stop_id.as_str()),
                &station_by_stop_id,
                trip.direction,
            );
            if !stations.is_empty() {
                sequences_by_route.entry(route_pk).or_default().push(stations);
            }
        }

        replace_maps(querier, &config.id, config.pk, route_id_to_pk.values(), &sequences_by_route)
            .await?;
    }
    Ok(())
}

/// Rebuilds every realtime-source service map of the system from the
/// currently stored trips. Called at the end of each realtime update.
pub async fn update_realtime_maps(querier: &dyn Querier, system_pk: Pk) -> QueryResult<()> {
    let configs: Vec<_> = querier
        .list_service_map_configs(system_pk)
        .await?
        .into_iter()
        .filter(|c| c.source == ServiceMapSource::Realtime)
        .collect();
    if configs.is_empty() {
        return Ok(());
    }

    let routes = querier.list_routes(system_pk).await?;
    let route_pks: Vec<Pk> = routes.iter().map(|r| r.pk).collect();
    let trips = querier.list_trips_for_update(&route_pks).await?;
    let stops = querier.list_stops(system_pk).await?;
    let station_by_stop_pk = station_pk_by_stop_pk(&stops);

    let mut sequences_by_route: HashMap<Pk, Vec<Vec<Pk>>> = HashMap::new();
    for trip in &trips {
        let mut stations: Vec<Pk> = trip
            .stop_times
            .iter()
            .filter_map(|st| station_by_stop_pk.get(&st.stop_pk).copied())
            .collect();
        if trip.direction == Some(false) {
            stations.reverse();
        }
        stations.dedup();
        if !stations.is_empty() {
            sequences_by_route
                .entry(trip.route_pk)
                .or_default()
                .push(stations);
        }
    }

    for config in configs {
        replace_maps(querier, &config.id, config.pk, route_pks.iter(), &sequences_by_route)
            .await?;
    }
    Ok(())
}

async fn replace_maps(
    querier: &dyn Querier,
    config_id: &str,
    config_pk: Pk,
    route_pks: impl Iterator<Item = &Pk>,
    sequences_by_route: &HashMap<Pk, Vec<Vec<Pk>>>,
) -> QueryResult<()> {
    static EMPTY: Vec<Vec<Pk>> = Vec::new();
    for &route_pk in route_pks {
        let sequences = sequences_by_route.get(&route_pk).unwrap_or(&EMPTY);
        match build_route_ordering(sequences) {
            Ok(ordering) => {
                querier
                    .replace_service_map(config_pk, route_pk, &ordering)
                    .await?;
            }
            Err(_) => {
                // Fail safe stale: keep whatever map the route had.
                log::debug!(
                    "Service map {} not updated for route {}: station graph has a cycle",
                    config_id,
                    route_pk
                );
            }
        }
    }
    Ok(())
}

/// Deduplicates the edge multiset into a simple graph and topologically
/// sorts it.
fn build_route_ordering(
    sequences: &[Vec<Pk>],
) -> Result<Vec<Pk>, crate::graph::NotSortableError> {
    let mut graph = Graph::new();
    for sequence in sequences {
        for &station in sequence {
            graph.add_node(station);
        }
        for window in sequence.windows(2) {
            graph.add_edge(window[0], window[1]);
        }
    }
    graph.sort_basic()
}

/// Maps a trip's stop ids to station pks, honoring the direction flag and
/// collapsing consecutive duplicates. Unknown stop ids contribute nothing.
fn station_sequence<'a>(
    stop_ids: impl Iterator<Item = &'a str>,
    station_by_stop_id: &HashMap<String, Pk>,
    direction: Option<bool>,
) -> Vec<Pk> {
    let mut stations: Vec<Pk> = stop_ids
        .filter_map(|id| station_by_stop_id.get(id).copied())
        .collect();
    if direction == Some(false) {
        stations.reverse();
    }
    stations.dedup();
    stations
}

fn trip_matches_filter(
    trip: &ParsedTrip,
    services: &HashMap<String, ParsedService>,
    filter: Option<&StaticMapFilter>,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };

    if let Some(days) = &filter.days {
        let Some(service) = services.get(&trip.service_id) else {
            return false;
        };
        for day in days {
            match parse_weekday(day) {
                Some(day) if service.runs_on(day) => {}
                _ => return false,
            }
        }
    }

    let start = trip.start_time();
    let end = trip.end_time();
    if let Some(bound) = filter.starts_earlier_than {
        if !matches!(start, Some(t) if t < bound) {
            return false;
        }
    }
    if let Some(bound) = filter.starts_later_than {
        if !matches!(start, Some(t) if t > bound) {
            return false;
        }
    }
    if let Some(bound) = filter.ends_earlier_than {
        if !matches!(end, Some(t) if t < bound) {
            return false;
        }
    }
    if let Some(bound) = filter.ends_later_than {
        if !matches!(end, Some(t) if t > bound) {
            return false;
        }
    }
    true
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name.to_ascii_lowercase().as_str() {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Resolves every stop pk to the pk of its owning station by walking the
/// parent chain.
fn station_pk_by_stop_pk(stops: &[Stop]) -> HashMap<Pk, Pk> {
    let by_pk: HashMap<Pk, &Stop> = stops.iter().map(|s| (s.pk, s)).collect();
    let mut result = HashMap::with_capacity(stops.len());
    for stop in stops {
        let mut current = stop;
        let mut visited = HashSet::new();
        while !current.is_station() && visited.insert(current.pk) {
            match current.parent_stop_pk.and_then(|pk| by_pk.get(&pk)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        result.insert(stop.pk, current.pk);
    }
    result
}
