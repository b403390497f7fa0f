//! Reconciles a parsed static feed against the store: diff by id, upsert,
//! then delete everything in the feed's footprint the update did not confirm.

use std::collections::{HashMap, HashSet};

use crate::db::querier::{Querier, QueryResult};
use crate::db::types::{Agency, Feed, Pk, Route, Stop, StopType, Transfer};
use crate::graph::{Graph, Tree};
use crate::gtfs::static_data::StaticFeed;
use crate::servicemaps;

/// Applies the parsed feed inside the caller's transaction. Entity rows end
/// up with `source_pk = update_pk`; anything in the feed's footprint that
/// kept an older source is deleted.
pub async fn run_static_update(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    parsed: &StaticFeed,
) -> QueryResult<()> {
    let agency_id_to_pk = update_agencies(querier, system_pk, feed, update_pk, parsed).await?;
    let route_id_to_pk =
        update_routes(querier, system_pk, feed, update_pk, parsed, &agency_id_to_pk).await?;
    update_stops(querier, system_pk, feed, update_pk, parsed).await?;
    update_transfers(querier, system_pk, feed, update_pk, parsed).await?;
    servicemaps::update_static_maps(querier, system_pk, parsed, &route_id_to_pk).await?;
    Ok(())
}

async fn update_agencies(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    parsed: &StaticFeed,
) -> QueryResult<HashMap<String, Pk>> {
    let mut id_to_pk = querier.map_agency_id_to_pk(system_pk).await?;
    for agency in &parsed.agencies {
        let row = Agency {
            pk: 0,
            id: agency.id.clone(),
            system_pk,
            source_pk: update_pk,
            name: agency.name.clone(),
            url: agency.url.clone(),
            timezone: agency.timezone.clone(),
            language: agency.language.clone(),
            phone: agency.phone.clone(),
            fare_url: agency.fare_url.clone(),
            email: agency.email.clone(),
        };
        match id_to_pk.get(&agency.id) {
            Some(&pk) => querier.update_agency(Agency { pk, ..row }).await?,
            None => {
                let pk = querier.insert_agency(row).await?;
                id_to_pk.insert(agency.id.clone(), pk);
            }
        }
    }
    let deleted = querier.delete_stale_agencies(feed.pk, update_pk).await?;
    if deleted > 0 {
        log::info!("Feed {}: deleted {} stale agencies", feed.id, deleted);
        id_to_pk = querier.map_agency_id_to_pk(system_pk).await?;
    }
    Ok(id_to_pk)
}

async fn update_routes(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    parsed: &StaticFeed,
    agency_id_to_pk: &HashMap<String, Pk>,
) -> QueryResult<HashMap<String, Pk>> {
    let mut id_to_pk = querier.map_route_id_to_pk(system_pk).await?;
    for route in &parsed.routes {
        let agency_pk = match &route.agency_id {
            Some(agency_id) => match agency_id_to_pk.get(agency_id) {
                Some(&pk) => Some(pk),
                None => {
                    log::warn!(
                        "Feed {}: skipping route {} referencing unknown agency {}",
                        feed.id,
                        route.id,
                        agency_id
                    );
                    continue;
                }
            },
            None => None,
        };
        let row = Route {
            pk: 0,
            id: route.id.clone(),
            system_pk,
            source_pk: update_pk,
            agency_pk,
            short_name: route.short_name.clone(),
            long_name: route.long_name.clone(),
            description: route.description.clone(),
            color: route.color.clone(),
            text_color: route.text_color.clone(),
            route_type: route.route_type,
        };
        match id_to_pk.get(&route.id) {
            Some(&pk) => querier.update_route(Route { pk, ..row }).await?,
            None => {
                let pk = querier.insert_route(row).await?;
                id_to_pk.insert(route.id.clone(), pk);
            }
        }
    }
    let deleted = querier.delete_stale_routes(feed.pk, update_pk).await?;
    if deleted > 0 {
        log::info!("Feed {}: deleted {} stale routes", feed.id, deleted);
        id_to_pk = querier.map_route_id_to_pk(system_pk).await?;
    }
    Ok(id_to_pk)
}

/// Stops are written in two passes. The first upserts every stop with no
/// parent, so that insertion order and stale deletion never see a dangling
/// parent pk. The second applies the parent links that survive the cycle
/// check.
async fn update_stops(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    parsed: &StaticFeed,
) -> QueryResult<()> {
    let mut id_to_pk = querier.map_stop_id_to_pk(system_pk).await?;
    for stop in &parsed.stops {
        let row = Stop {
            pk: 0,
            id: stop.id.clone(),
            system_pk,
            source_pk: update_pk,
            parent_stop_pk: None,
            name: stop.name.clone(),
            latitude: stop.latitude,
            longitude: stop.longitude,
            stop_type: StopType::from_gtfs_location_type(stop.location_type),
        };
        match id_to_pk.get(&stop.id) {
            Some(&pk) => querier.update_stop(Stop { pk, ..row }).await?,
            None => {
                let pk = querier.insert_stop(row).await?;
                id_to_pk.insert(stop.id.clone(), pk);
            }
        }
    }
    let deleted = querier.delete_stale_stops(feed.pk, update_pk).await?;
    if deleted > 0 {
        log::info!("Feed {}: deleted {} stale stops", feed.id, deleted);
        id_to_pk = querier.map_stop_id_to_pk(system_pk).await?;
    }

    let links = accept_parent_links(parsed);
    for &(child_id, parent_id) in &links {
        let (Some(&child_pk), Some(&parent_pk)) =
            (id_to_pk.get(child_id), id_to_pk.get(parent_id))
        else {
            log::warn!(
                "Feed {}: stop {} references unknown parent station {}",
                feed.id,
                child_id,
                parent_id
            );
            continue;
        };
        querier.update_stop_parent(child_pk, Some(parent_pk)).await?;
    }
    validate_hierarchy(feed, &links);
    Ok(())
}

/// Checks that each linked component of the stop hierarchy is a proper tree.
/// The cycle guard in [`accept_parent_links`] makes this hold; a warning
/// here means the guard and the feed disagree in a new way.
fn validate_hierarchy(feed: &Feed, links: &[(&str, &str)]) {
    let mut hierarchy = Graph::new();
    for &(child_id, parent_id) in links {
        hierarchy.add_edge(parent_id, child_id);
    }
    for root in hierarchy.roots() {
        if Tree::from_graph(&hierarchy.reachable_from(&root)).is_none() {
            log::warn!(
                "Feed {}: stop hierarchy under {} is not a tree",
                feed.id,
                root
            );
        }
    }
}

/// Filters the feed's parent_station references down to a forest: a link
/// that would close a cycle is dropped with a warning. Stops are considered
/// in feed order, so the earlier link of a cycle wins.
fn accept_parent_links(parsed: &StaticFeed) -> Vec<(&str, &str)> {
    let mut parent_of: HashMap<&str, &str> = HashMap::new();
    let mut accepted = Vec::new();
    for stop in &parsed.stops {
        let Some(parent_id) = stop.parent_station.as_deref() else {
            continue;
        };
        // Walk the accepted links upward from the proposed parent; hitting
        // this stop again means the new link would close a cycle.
        let mut cursor = parent_id;
        let mut cyclic = cursor == stop.id;
        let mut seen = HashSet::new();
        while !cyclic && seen.insert(cursor) {
            match parent_of.get(cursor) {
                Some(&next) => {
                    cyclic = next == stop.id;
                    cursor = next;
                }
                None => break,
            }
        }
        if cyclic {
            log::warn!(
                "Dropping parent link {} -> {}: it would create a cycle",
                stop.id,
                parent_id
            );
            continue;
        }
        parent_of.insert(stop.id.as_str(), parent_id);
        accepted.push((stop.id.as_str(), parent_id));
    }
    accepted
}

/// Transfers carry no external id, so the previous set is dropped wholesale
/// and the feed's rows reinserted. Rows naming unknown stops are skipped.
async fn update_transfers(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    parsed: &StaticFeed,
) -> QueryResult<()> {
    querier.delete_transfers(feed.pk).await?;
    let id_to_pk = querier.map_stop_id_to_pk(system_pk).await?;
    for transfer in &parsed.transfers {
        let (Some(&from_stop_pk), Some(&to_stop_pk)) = (
            id_to_pk.get(&transfer.from_stop_id),
            id_to_pk.get(&transfer.to_stop_id),
        ) else {
            log::debug!(
                "Feed {}: skipping transfer {} -> {} with unknown stop",
                feed.id,
                transfer.from_stop_id,
                transfer.to_stop_id
            );
            continue;
        };
        querier
            .insert_transfer(Transfer {
                pk: 0,
                system_pk,
                source_pk: update_pk,
                from_stop_pk,
                to_stop_pk,
                transfer_type: transfer.transfer_type,
                min_transfer_time: transfer.min_transfer_time,
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs::static_data::ParsedStop;

    fn stop(id: &str, parent: Option<&str>) -> ParsedStop {
        ParsedStop {
            id: id.to_string(),
            name: None,
            latitude: None,
            longitude: None,
            location_type: 0,
            parent_station: parent.map(|p| p.to_string()),
        }
    }

    #[test]
    fn parent_links_pass_through_for_a_forest() {
        let parsed = StaticFeed {
            stops: vec![
                stop("station", None),
                stop("platform-a", Some("station")),
                stop("platform-b", Some("station")),
            ],
            ..Default::default()
        };
        assert_eq!(
            accept_parent_links(&parsed),
            vec![("platform-a", "station"), ("platform-b", "station")]
        );
    }

    #[test]
    fn self_parent_is_dropped() {
        let parsed = StaticFeed {
            stops: vec![stop("a", Some("a"))],
            ..Default::default()
        };
        assert!(accept_parent_links(&parsed).is_empty());
    }

    #[test]
    fn cycle_keeps_earlier_link() {
        let parsed = StaticFeed {
            stops: vec![stop("a", Some("b")), stop("b", Some("a"))],
            ..Default::default()
        };
        assert_eq!(accept_parent_links(&parsed), vec![("a", "b")]);
    }

    #[test]
    fn longer_cycle_is_broken_once() {
        let parsed = StaticFeed {
            stops: vec![
                stop("a", Some("b")),
                stop("b", Some("c")),
                stop("c", Some("a")),
            ],
            ..Default::default()
        };
        assert_eq!(accept_parent_links(&parsed), vec![("a", "b"), ("b", "c")]);
    }
}
