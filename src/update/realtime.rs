//! Reconciles a GTFS-realtime payload against the stored trips.
//!
//! Trips are identified by (route, external trip id). Stop times are matched
//! by stop sequence, which many feeds omit or garble, so sequences are
//! repaired before matching: a reported sequence is trusted only while the
//! result stays strictly increasing, stored sequences are reused where they
//! fit, and everything else falls back to the previous sequence plus one.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::db::querier::{Querier, QueryResult, TripForUpdate};
use crate::db::types::{Feed, Pk, StopTime, Trip};
use crate::gtfs::realtime::{RealtimeEvent, RealtimeFeed, RealtimeTrip};
use crate::servicemaps;

/// Applies the parsed payload inside the caller's transaction. Trips the
/// payload no longer mentions are deleted; stop times already in the past
/// are kept as a record of the vehicle's path.
pub async fn run_realtime_update(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    parsed: &RealtimeFeed,
) -> QueryResult<()> {
    let route_id_to_pk = querier.map_route_id_to_pk(system_pk).await?;
    let stop_id_to_pk = querier.map_stop_id_to_pk(system_pk).await?;

    let trips = dedup_trips(&parsed.trips, &route_id_to_pk, feed);

    let route_pks: Vec<Pk> = trips.iter().map(|(uid, _)| uid.0).unique().collect();
    let existing_by_uid: HashMap<TripUid, TripForUpdate> = querier
        .list_trips_for_update(&route_pks)
        .await?
        .into_iter()
        .map(|t| ((t.route_pk, t.id.clone()), t))
        .collect();

    for (uid, trip) in &trips {
        let existing = existing_by_uid.get(uid);
        update_trip(querier, feed, update_pk, uid, trip, existing, &stop_id_to_pk).await?;
    }

    let deleted = querier.delete_stale_trips(feed.pk, update_pk).await?;
    if deleted > 0 {
        log::debug!("Feed {}: deleted {} finished trips", feed.id, deleted);
    }

    servicemaps::update_realtime_maps(querier, system_pk).await?;
    Ok(())
}

type TripUid = (Pk, String);

/// Resolves each payload trip to its (route pk, trip id) identity and drops
/// duplicates, keeping the first occurrence. Trips on unknown routes carry
/// nothing the store can hold.
fn dedup_trips<'a>(
    trips: &'a [RealtimeTrip],
    route_id_to_pk: &HashMap<String, Pk>,
    feed: &Feed,
) -> Vec<(TripUid, &'a RealtimeTrip)> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for trip in trips {
        let Some(route_pk) = trip
            .route_id
            .as_ref()
            .and_then(|id| route_id_to_pk.get(id).copied())
        else {
            log::debug!(
                "Feed {}: skipping trip {} on unknown route {:?}",
                feed.id,
                trip.id,
                trip.route_id
            );
            continue;
        };
        let uid = (route_pk, trip.id.clone());
        if !seen.insert(uid.clone()) {
            log::debug!("Feed {}: duplicate trip {} in payload", feed.id, trip.id);
            continue;
        }
        result.push((uid, trip));
    }
    result
}

struct ResolvedStopTime {
    stop_pk: Pk,
    raw_sequence: Option<i32>,
    stop_sequence: i32,
    arrival: Option<RealtimeEvent>,
    departure: Option<RealtimeEvent>,
}

async fn update_trip(
    querier: &dyn Querier,
    feed: &Feed,
    update_pk: Pk,
    uid: &TripUid,
    trip: &RealtimeTrip,
    existing: Option<&TripForUpdate>,
    stop_id_to_pk: &HashMap<String, Pk>,
) -> QueryResult<()> {
    let mut stop_times: Vec<ResolvedStopTime> = trip
        .stop_times
        .iter()
        .filter_map(|st| {
            let stop_pk = st
                .stop_id
                .as_ref()
                .and_then(|id| stop_id_to_pk.get(id).copied());
            if stop_pk.is_none() {
                log::debug!(
                    "Feed {}: trip {} references unknown stop {:?}",
                    feed.id,
                    trip.id,
                    st.stop_id
                );
            }
            Some(ResolvedStopTime {
                stop_pk: stop_pk?,
                raw_sequence: st.stop_sequence,
                stop_sequence: 0,
                arrival: st.arrival,
                departure: st.departure,
            })
        })
        .collect();
    populate_stop_sequences(&mut stop_times, existing);

    // Sequences before the first one in the payload belong to stops the
    // vehicle has already passed.
    let current_sequence = stop_times
        .first()
        .map(|st| st.stop_sequence)
        .unwrap_or(i32::MAX);

    let row = Trip {
        pk: 0,
        id: uid.1.clone(),
        route_pk: uid.0,
        source_pk: update_pk,
        direction: trip.direction,
        vehicle_id: trip.vehicle_id.clone(),
        vehicle_label: trip.vehicle_label.clone(),
    };
    let trip_pk = match existing {
        Some(existing) => {
            querier.update_trip(Trip { pk: existing.pk, ..row }).await?;
            existing.pk
        }
        None => querier.insert_trip(row).await?,
    };

    let mut existing_by_sequence: HashMap<i32, Pk> = existing
        .map(|t| {
            t.stop_times
                .iter()
                .map(|st| (st.stop_sequence, st.pk))
                .collect()
        })
        .unwrap_or_default();

    for st in &stop_times {
        let row = StopTime {
            pk: 0,
            trip_pk,
            stop_pk: st.stop_pk,
            stop_sequence: st.stop_sequence,
            past: false,
            arrival_time: st.arrival.and_then(|e| e.time),
            arrival_delay: st.arrival.and_then(|e| e.delay),
            arrival_uncertainty: st.arrival.and_then(|e| e.uncertainty),
            departure_time: st.departure.and_then(|e| e.time),
            departure_delay: st.departure.and_then(|e| e.delay),
            departure_uncertainty: st.departure.and_then(|e| e.uncertainty),
        };
        match existing_by_sequence.remove(&st.stop_sequence) {
            Some(pk) => querier.update_stop_time(StopTime { pk, ..row }).await?,
            None => {
                querier.insert_stop_time(row).await?;
            }
        }
    }

    // Unconsumed stop times at or past the vehicle's position were dropped
    // from the schedule; earlier ones stay as the passed-stop record.
    let obsolete: Vec<Pk> = existing_by_sequence
        .iter()
        .filter(|(&sequence, _)| sequence >= current_sequence)
        .map(|(_, &pk)| pk)
        .collect();
    if !obsolete.is_empty() {
        querier.delete_stop_times(&obsolete).await?;
    }

    querier.mark_stop_times_past(trip_pk, current_sequence).await?;
    Ok(())
}

/// Assigns a strictly increasing sequence to every stop time.
///
/// A reported sequence is used as-is while it keeps the run increasing.
/// Otherwise, if the stored trip already has a sequence for the stop and it
/// fits, that one is reused so the row keeps its identity; reuse is off when
/// the payload visits a stop twice, since the stored sequence is then
/// ambiguous. The final fallback is the previous sequence plus one.
fn populate_stop_sequences(stop_times: &mut [ResolvedStopTime], existing: Option<&TripForUpdate>) {
    let stored: HashMap<Pk, i32> = existing
        .map(|t| {
            t.stop_times
                .iter()
                .map(|st| (st.stop_pk, st.stop_sequence))
                .collect()
        })
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let reuse_stored = stop_times.iter().all(|st| seen.insert(st.stop_pk));

    let mut last = -1;
    for st in stop_times {
        st.stop_sequence = match st.raw_sequence {
            Some(sequence) if sequence > last => sequence,
            _ => match stored.get(&st.stop_pk) {
                Some(&sequence) if reuse_stored && sequence > last => sequence,
                _ => last + 1,
            },
        };
        last = st.stop_sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::querier::ExistingStopTime;

    fn resolved(stop_pk: Pk, raw_sequence: Option<i32>) -> ResolvedStopTime {
        ResolvedStopTime {
            stop_pk,
            raw_sequence,
            stop_sequence: 0,
            arrival: None,
            departure: None,
        }
    }

    fn stored_trip(stop_times: &[(Pk, i32)]) -> TripForUpdate {
        TripForUpdate {
            pk: 1,
            id: "t".to_string(),
            route_pk: 1,
            direction: None,
            stop_times: stop_times
                .iter()
                .map(|&(stop_pk, stop_sequence)| ExistingStopTime {
                    pk: 100 + stop_sequence as Pk,
                    stop_pk,
                    stop_sequence,
                    past: false,
                })
                .collect(),
        }
    }

    fn sequences(stop_times: &[ResolvedStopTime]) -> Vec<i32> {
        stop_times.iter().map(|st| st.stop_sequence).collect()
    }

    #[test]
    fn increasing_raw_sequences_are_trusted() {
        let mut stop_times = vec![resolved(1, Some(4)), resolved(2, Some(7)), resolved(3, Some(9))];
        populate_stop_sequences(&mut stop_times, None);
        assert_eq!(sequences(&stop_times), vec![4, 7, 9]);
    }

    #[test]
    fn missing_sequences_count_up_from_zero() {
        let mut stop_times = vec![resolved(1, None), resolved(2, None), resolved(3, None)];
        populate_stop_sequences(&mut stop_times, None);
        assert_eq!(sequences(&stop_times), vec![0, 1, 2]);
    }

    #[test]
    fn non_increasing_raw_sequence_falls_back() {
        let mut stop_times = vec![resolved(1, Some(5)), resolved(2, Some(5)), resolved(3, Some(4))];
        populate_stop_sequences(&mut stop_times, None);
        assert_eq!(sequences(&stop_times), vec![5, 6, 7]);
    }

    #[test]
    fn stored_sequences_are_reused() {
        let existing = stored_trip(&[(1, 10), (2, 12), (3, 15)]);
        let mut stop_times = vec![resolved(2, None), resolved(3, None)];
        populate_stop_sequences(&mut stop_times, Some(&existing));
        assert_eq!(sequences(&stop_times), vec![12, 15]);
    }

    #[test]
    fn stored_sequence_behind_watermark_is_ignored() {
        let existing = stored_trip(&[(1, 10), (2, 3)]);
        let mut stop_times = vec![resolved(1, None), resolved(2, None)];
        populate_stop_sequences(&mut stop_times, Some(&existing));
        assert_eq!(sequences(&stop_times), vec![10, 11]);
    }

    #[test]
    fn double_visit_disables_reuse() {
        // A loop trip visits stop 1 twice; its stored sequence is ambiguous.
        let existing = stored_trip(&[(1, 10), (2, 12)]);
        let mut stop_times = vec![resolved(1, None), resolved(2, None), resolved(1, None)];
        populate_stop_sequences(&mut stop_times, Some(&existing));
        assert_eq!(sequences(&stop_times), vec![0, 1, 2]);
    }
}
