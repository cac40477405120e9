//! Dynamic trip status: where a trip is right now.

use crate::geo;
use crate::providers::gtfs::realtime::RealtimeSnapshot;
use crate::providers::gtfs::static_data::{StaticStore, StopTime};

use super::blocks::{self, BlockLayout};
use super::prediction;
use super::service_day::ServiceDay;

/// Reconstructed status of one trip at one instant. Wire encoding happens
/// at the API layer; optional fields stay optional here.
#[derive(Debug, Clone)]
pub struct TripStatusInfo {
    /// The trip actually being served; differs from the requested trip when
    /// the vehicle reports another trip in the block.
    pub active_trip_id: String,
    pub block_trip_sequence: u32,
    pub service_date_ms: i64,
    /// scheduled | approaching | stopped | in_progress
    pub phase: &'static str,
    pub status: &'static str,
    pub predicted: bool,
    /// True when the status derives purely from the schedule (no vehicle)
    pub scheduled: bool,
    pub position: Option<(f64, f64)>,
    pub orientation_deg: f64,
    pub closest_stop: Option<String>,
    pub closest_stop_time_offset_s: i64,
    pub next_stop: Option<String>,
    pub next_stop_time_offset_s: i64,
    pub distance_along_trip_m: f64,
    pub total_distance_along_trip_m: f64,
    pub scheduled_distance_along_trip_m: f64,
    pub distance_along_block_m: f64,
    /// Positive = late, seconds
    pub schedule_deviation_s: i64,
    pub vehicle_id: Option<String>,
    pub last_update_ms: i64,
    pub last_location_update_ms: i64,
    pub situation_ids: Vec<String>,
}

/// Map GTFS-RT `current_status` onto (status, phase).
fn phase_for(current_status: Option<i32>) -> (&'static str, &'static str) {
    match current_status {
        Some(0) => ("INCOMING_AT", "approaching"),
        Some(1) => ("STOPPED_AT", "stopped"),
        Some(2) => ("IN_TRANSIT_TO", "in_progress"),
        _ => ("SCHEDULED", "scheduled"),
    }
}

/// Compass bearing (0 = north, clockwise) to mathematical orientation
/// (0 = east, counter-clockwise).
fn orientation_from_bearing(bearing: f64) -> f64 {
    (90.0 - bearing).rem_euclid(360.0)
}

/// Linear interpolation of the trip's stop distances at `secs` since the
/// service-day midnight, clamped to the endpoints.
fn scheduled_distance_at(stop_times: &[StopTime], distances: &[f64], secs: i64) -> f64 {
    let mut prev: Option<(i64, f64)> = None;
    for (st, &dist) in stop_times.iter().zip(distances) {
        let Some(t) = st.arrival_or_departure() else {
            continue;
        };
        let t = i64::from(t);
        if secs <= t {
            return match prev {
                Some((pt, pd)) if t > pt => {
                    let frac = (secs - pt) as f64 / (t - pt) as f64;
                    pd + frac.clamp(0.0, 1.0) * (dist - pd)
                }
                _ => dist,
            };
        }
        prev = Some((i64::from(st.departure_or_arrival().unwrap_or(t as i32)), dist));
    }
    prev.map(|(_, d)| d).unwrap_or(0.0)
}

/// Build the status of `trip_id` at `now_ms` on a service day.
/// `None` when the trip is unknown to the static store.
pub fn build(
    store: &StaticStore,
    snapshot: &RealtimeSnapshot,
    trip_id: &str,
    day: ServiceDay,
    now_ms: i64,
) -> Option<TripStatusInfo> {
    build_with_vehicle(
        store,
        snapshot,
        trip_id,
        day,
        now_ms,
        snapshot.vehicle_for_trip(trip_id),
    )
}

/// Like [`build`], but with the vehicle chosen by the caller. Mode A
/// requests may pin a vehicle by ID, and that vehicle's reported trip wins
/// as `active_trip_id`.
pub fn build_with_vehicle(
    store: &StaticStore,
    snapshot: &RealtimeSnapshot,
    trip_id: &str,
    day: ServiceDay,
    now_ms: i64,
    vehicle: Option<&crate::providers::gtfs::realtime::VehicleRecord>,
) -> Option<TripStatusInfo> {
    let trip = store.trips.get(trip_id)?;
    let stop_times = store.stop_times_for_trip(trip_id);
    let distances = blocks::stop_distances_along_trip(store, trip_id);
    let layout = BlockLayout::for_trip(store, trip_id, day);
    let block_entry = layout.entry(trip_id);

    let trip_update = snapshot.trip_update_for_trip(trip_id);

    let active_trip_id = vehicle
        .and_then(|v| v.trip_id.clone())
        .unwrap_or_else(|| trip_id.to_string());

    let (status, phase) = phase_for(vehicle.and_then(|v| v.current_status));

    let now_secs = day.secs_since_midnight(now_ms);

    // Closest stop: by straight-line distance to the vehicle, or by schedule
    // proximity when nothing is on the road.
    let closest = match vehicle {
        Some(v) => stop_times
            .iter()
            .filter_map(|st| {
                let stop = store.stops.get(&st.stop_id)?;
                let d = geo::haversine(v.lat, v.lon, stop.lat, stop.lon);
                Some((st, d))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(st, _)| st),
        None => stop_times
            .iter()
            .filter(|st| st.arrival_or_departure().is_some())
            .min_by_key(|st| (i64::from(st.arrival_or_departure().unwrap()) - now_secs).abs()),
    };

    let closest_stop_time_offset_s = closest
        .and_then(|st| st.arrival_or_departure())
        .map(|t| i64::from(t) - now_secs)
        .unwrap_or(0);

    // Next stop: the first one past the vehicle's reported sequence, or the
    // first one still ahead of the clock.
    let next = match vehicle.and_then(|v| v.current_stop_sequence) {
        Some(current) => stop_times.iter().find(|st| st.stop_sequence > current),
        None => stop_times.iter().find(|st| {
            st.departure_or_arrival()
                .map(|t| i64::from(t) > now_secs)
                .unwrap_or(false)
        }),
    };

    let next_stop_time_offset_s = next
        .and_then(|st| st.arrival_or_departure())
        .map(|t| i64::from(t) - now_secs)
        .unwrap_or(0);

    let polyline = store.trip_polyline(trip_id);
    let total_distance = block_entry
        .map(|e| e.trip_length_m)
        .unwrap_or_else(|| blocks::trip_shape_length_m(store, trip_id));

    let closest_index = closest.map(|st| {
        stop_times
            .iter()
            .position(|s| s.stop_sequence == st.stop_sequence)
            .unwrap_or(0)
    });

    let distance_along_trip = match vehicle {
        Some(v) if polyline.len() >= 2 => {
            geo::distance_along_polyline(v.lat, v.lon, &polyline).unwrap_or(0.0)
        }
        Some(_) | None => closest_index
            .and_then(|i| distances.get(i).copied())
            .unwrap_or(0.0),
    };

    let scheduled_distance = scheduled_distance_at(stop_times, &distances, now_secs);

    // Deviation measured at the closest stop: predicted minus scheduled
    let schedule_deviation_s = closest
        .map(|st| {
            let arr = st.arrival_or_departure().map(|t| day.time_at_secs(t));
            let dep = st.departure_or_arrival().map(|t| day.time_at_secs(t));
            match (arr, dep) {
                (Some(arr), Some(dep)) => {
                    let fused = prediction::fuse(
                        arr,
                        dep,
                        &st.stop_id,
                        st.stop_sequence,
                        trip_update,
                        vehicle.is_some(),
                    );
                    fused
                        .arrival_ms
                        .filter(|_| fused.predicted)
                        .map(|p| (p - arr) / 1000)
                        .unwrap_or(0)
                }
                _ => 0,
            }
        })
        .unwrap_or(0);

    let mut situation_ids: Vec<String> = Vec::new();
    for situation in snapshot
        .situations_for_trip(trip_id)
        .into_iter()
        .chain(snapshot.situations_for_route(&trip.route_id))
    {
        if !situation_ids.contains(&situation.id) {
            situation_ids.push(situation.id.clone());
        }
    }

    Some(TripStatusInfo {
        active_trip_id,
        block_trip_sequence: layout.sequence_or_default(trip_id),
        service_date_ms: day.epoch_ms(),
        phase,
        status,
        predicted: vehicle.is_some() || trip_update.is_some(),
        scheduled: vehicle.is_none(),
        position: vehicle.map(|v| (v.lat, v.lon)),
        orientation_deg: vehicle
            .and_then(|v| v.bearing)
            .map(orientation_from_bearing)
            .unwrap_or(0.0),
        closest_stop: closest.map(|st| st.stop_id.clone()),
        closest_stop_time_offset_s,
        next_stop: next.map(|st| st.stop_id.clone()),
        next_stop_time_offset_s,
        distance_along_trip_m: distance_along_trip,
        total_distance_along_trip_m: total_distance,
        scheduled_distance_along_trip_m: scheduled_distance,
        distance_along_block_m: block_entry
            .map(|e| e.distance_offset_m + distance_along_trip)
            .unwrap_or(distance_along_trip),
        schedule_deviation_s,
        vehicle_id: vehicle
            .map(|v| v.vehicle_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| trip_update.and_then(|tu| tu.vehicle_id.clone())),
        last_update_ms: vehicle
            .map(|v| v.timestamp_ms)
            .or_else(|| trip_update.and_then(|tu| tu.timestamp_ms))
            .unwrap_or(0),
        last_location_update_ms: vehicle.map(|v| v.timestamp_ms).unwrap_or(0),
        situation_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::gtfs::realtime::test_fixtures as rt;
    use crate::providers::gtfs::static_data::test_fixtures;
    use chrono::NaiveDate;
    use chrono_tz::America::Los_Angeles;

    fn monday() -> ServiceDay {
        ServiceDay::from_date(Los_Angeles, NaiveDate::from_ymd_opt(2024, 6, 10).unwrap())
    }

    #[test]
    fn test_orientation_from_bearing() {
        assert_eq!(orientation_from_bearing(0.0), 90.0); // north -> 90
        assert_eq!(orientation_from_bearing(90.0), 0.0); // east -> 0
        assert_eq!(orientation_from_bearing(180.0), 270.0); // south -> 270
        assert_eq!(orientation_from_bearing(270.0), 180.0); // west -> 180
        assert_eq!(orientation_from_bearing(450.0), 0.0);
    }

    #[test]
    fn test_unknown_trip_is_none() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        assert!(build(&store, &snapshot, "nope", monday(), 0).is_none());
    }

    #[test]
    fn test_schedule_only_status() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        // 08:06 local, mid-trip
        let now = monday().time_at_secs(8 * 3600 + 6 * 60);
        let status = build(&store, &snapshot, "trip_0800", monday(), now).unwrap();

        assert_eq!(status.active_trip_id, "trip_0800");
        assert_eq!(status.phase, "scheduled");
        assert_eq!(status.status, "SCHEDULED");
        assert!(!status.predicted);
        assert!(status.scheduled);
        assert!(status.position.is_none());
        assert_eq!(status.vehicle_id, None);
        assert_eq!(status.last_update_ms, 0);
        // 08:06 is closest in time to the 08:10 stop
        assert_eq!(status.closest_stop.as_deref(), Some("22010"));
        assert_eq!(status.closest_stop_time_offset_s, 4 * 60);
        // Next stop is the first departure still ahead
        assert_eq!(status.next_stop.as_deref(), Some("22010"));
    }

    #[test]
    fn test_vehicle_drives_position_phase_and_closest_stop() {
        let store = test_fixtures::store();
        // Vehicle sitting on the middle stop, stopped, heading east
        let feed = rt::feed(vec![rt::vehicle_entity(
            "e1", "bus42", Some("trip_0800"), 38.5450, -121.7450, Some(90.0), Some(2), Some(1),
        )]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let now = monday().time_at_secs(8 * 3600 + 10 * 60);
        let status = build(&store, &snapshot, "trip_0800", monday(), now).unwrap();

        assert_eq!(status.status, "STOPPED_AT");
        assert_eq!(status.phase, "stopped");
        assert!(status.predicted);
        assert!(!status.scheduled);
        assert_eq!(status.position, Some((38.5450, -121.7450)));
        assert_eq!(status.orientation_deg, 0.0);
        assert_eq!(status.closest_stop.as_deref(), Some("22010"));
        assert_eq!(status.vehicle_id.as_deref(), Some("bus42"));
        assert_eq!(status.last_location_update_ms, 1_718_000_100_000);
        // Next stop comes from the reported sequence (2 -> sequence 3)
        assert_eq!(status.next_stop.as_deref(), Some("22020"));
        // Mid-route: some distance along, less than the total
        assert!(status.distance_along_trip_m > 0.0);
        assert!(status.distance_along_trip_m < status.total_distance_along_trip_m);
    }

    #[test]
    fn test_schedule_deviation_from_trip_update() {
        let store = test_fixtures::store();
        let feed = rt::feed(vec![
            rt::vehicle_entity(
                "e1", "bus42", Some("trip_0800"), 38.5450, -121.7450, None, Some(2), Some(1),
            ),
            rt::trip_update_entity(
                "e2",
                "trip_0800",
                Some("bus42"),
                vec![rt::stop_time_update(Some("22010"), Some(2), Some(120), None, Some(120), None)],
            ),
        ]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let now = monday().time_at_secs(8 * 3600 + 10 * 60);
        let status = build(&store, &snapshot, "trip_0800", monday(), now).unwrap();

        assert_eq!(status.schedule_deviation_s, 120);
    }

    #[test]
    fn test_pinned_vehicle_reports_other_trip_in_block() {
        let store = test_fixtures::store();
        // The vehicle is already serving the next trip of the block
        let feed = rt::feed(vec![rt::vehicle_entity(
            "e1", "bus42", Some("trip_1000"), 38.5450, -121.7450, None, Some(1), Some(2),
        )]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let vehicle = snapshot.vehicle_by_id("bus42");
        let now = monday().time_at_secs(10 * 3600);
        let status =
            build_with_vehicle(&store, &snapshot, "trip_0800", monday(), now, vehicle).unwrap();
        // The vehicle's reported trip wins
        assert_eq!(status.active_trip_id, "trip_1000");
        assert_eq!(status.block_trip_sequence, 0);
    }

    #[test]
    fn test_block_distance_offsets_second_trip() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        let now = monday().time_at_secs(10 * 3600);
        let status = build(&store, &snapshot, "trip_1000", monday(), now).unwrap();

        assert_eq!(status.block_trip_sequence, 1);
        // Block distance includes the first trip's full length
        assert!(status.distance_along_block_m >= status.distance_along_trip_m);
        let first_len = blocks::trip_shape_length_m(&store, "trip_0800");
        assert!((status.distance_along_block_m - status.distance_along_trip_m - first_len).abs() < 1e-6);
    }

    #[test]
    fn test_scheduled_distance_interpolates() {
        let store = test_fixtures::store();
        let stop_times = store.stop_times_for_trip("trip_0800");
        let distances = blocks::stop_distances_along_trip(&store, "trip_0800");

        // Before the trip starts: clamped to the first stop
        assert_eq!(scheduled_distance_at(stop_times, &distances, 0), 0.0);
        // Past the end: clamped to the last stop
        let end = scheduled_distance_at(stop_times, &distances, 86_400);
        assert!((end - *distances.last().unwrap()).abs() < 1e-9);
        // Halfway between the first two stops (departs 08:00:30, arrives 08:10)
        let mid = scheduled_distance_at(stop_times, &distances, 8 * 3600 + 5 * 60);
        assert!(mid > 0.0 && mid < distances[1], "mid {mid}");
    }

    #[test]
    fn test_situations_collected_for_trip_and_route() {
        let store = test_fixtures::store();
        let feed = rt::feed(vec![rt::alert_entity(
            "alert_route",
            "Detour",
            vec![rt::route_selector("route_g")],
        )]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let now = monday().time_at_secs(8 * 3600);
        let status = build(&store, &snapshot, "trip_0800", monday(), now).unwrap();
        assert_eq!(status.situation_ids, ["alert_route"]);
    }
}
