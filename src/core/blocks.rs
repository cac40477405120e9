//! Block sequencing for interlined trips.
//!
//! A block is the chain of trips one vehicle operates across a service day.
//! The layout computed here gives every trip a stable sequence index and a
//! cumulative distance offset so a vehicle can be placed anywhere in the
//! chain.

use crate::geo;
use crate::providers::gtfs::static_data::StaticStore;

use super::service_day::ServiceDay;

#[derive(Debug, Clone)]
pub struct BlockTripEntry {
    pub trip_id: String,
    /// 0-based position in the block's departure-time ordering
    pub sequence: u32,
    /// Earliest departure on the trip, seconds since service-day midnight
    pub start_secs: i32,
    /// Number of stop_times on all prior trips in the block
    pub stop_offset: u32,
    /// Cumulative block distance at the start of this trip, meters
    pub distance_offset_m: f64,
    pub trip_length_m: f64,
}

#[derive(Debug, Clone)]
pub struct BlockLayout {
    pub block_id: Option<String>,
    pub service_day: ServiceDay,
    /// Active trips ordered by (start time, trip_id)
    pub trips: Vec<BlockTripEntry>,
}

impl BlockLayout {
    /// Layout for a block on a service day. Only trips whose service is
    /// active on the day participate; an out-of-range date yields an empty
    /// trip list that callers must treat as "unknown".
    pub fn for_block(store: &StaticStore, block_id: &str, day: ServiceDay) -> Self {
        let mut candidates: Vec<(String, i32)> = store
            .trips_in_block(block_id)
            .iter()
            .filter_map(|trip_id| {
                let trip = store.trips.get(trip_id)?;
                if !store.is_service_active(&trip.service_id, day.date) {
                    return None;
                }
                let start_secs = store
                    .stop_times_for_trip(trip_id)
                    .iter()
                    .filter_map(|st| st.departure_or_arrival())
                    .min()?;
                Some((trip_id.clone(), start_secs))
            })
            .collect();

        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut trips = Vec::with_capacity(candidates.len());
        let mut distance_offset_m = 0.0;
        let mut stop_offset = 0u32;
        for (sequence, (trip_id, start_secs)) in candidates.into_iter().enumerate() {
            let trip_length_m = trip_shape_length_m(store, &trip_id);
            let stop_count = store.stop_times_for_trip(&trip_id).len() as u32;
            trips.push(BlockTripEntry {
                trip_id,
                sequence: sequence as u32,
                start_secs,
                stop_offset,
                distance_offset_m,
                trip_length_m,
            });
            distance_offset_m += trip_length_m;
            stop_offset += stop_count;
        }

        Self {
            block_id: Some(block_id.to_string()),
            service_day: day,
            trips,
        }
    }

    /// Layout for the block a trip belongs to. A trip without a block_id is
    /// a block of one: sequence 0, distance offset 0.
    pub fn for_trip(store: &StaticStore, trip_id: &str, day: ServiceDay) -> Self {
        let block_id = store.trips.get(trip_id).and_then(|t| t.block_id.clone());
        match block_id {
            Some(block_id) => Self::for_block(store, &block_id, day),
            None => {
                let start_secs = store
                    .stop_times_for_trip(trip_id)
                    .iter()
                    .filter_map(|st| st.departure_or_arrival())
                    .min()
                    .unwrap_or(0);
                Self {
                    block_id: None,
                    service_day: day,
                    trips: vec![BlockTripEntry {
                        trip_id: trip_id.to_string(),
                        sequence: 0,
                        start_secs,
                        stop_offset: 0,
                        distance_offset_m: 0.0,
                        trip_length_m: trip_shape_length_m(store, trip_id),
                    }],
                }
            }
        }
    }

    pub fn entry(&self, trip_id: &str) -> Option<&BlockTripEntry> {
        self.trips.iter().find(|t| t.trip_id == trip_id)
    }

    /// The trip's block sequence, or 0 when the trip is not in the active
    /// layout (unknown per the edge-case contract).
    pub fn sequence_or_default(&self, trip_id: &str) -> u32 {
        self.entry(trip_id).map(|e| e.sequence).unwrap_or(0)
    }

    pub fn previous_trip(&self, trip_id: &str) -> Option<&BlockTripEntry> {
        let entry = self.entry(trip_id)?;
        let idx = entry.sequence as usize;
        if idx == 0 {
            None
        } else {
            self.trips.get(idx - 1)
        }
    }

    pub fn next_trip(&self, trip_id: &str) -> Option<&BlockTripEntry> {
        let entry = self.entry(trip_id)?;
        self.trips.get(entry.sequence as usize + 1)
    }
}

/// Length of a trip's path: total shape polyline length, or the sum of
/// straight-line hops between successive stops when no usable shape exists.
pub fn trip_shape_length_m(store: &StaticStore, trip_id: &str) -> f64 {
    let polyline = store.trip_polyline(trip_id);
    if polyline.len() >= 2 {
        return geo::polyline_length(&polyline);
    }

    let coords = stop_coords(store, trip_id);
    geo::polyline_length(&coords)
}

/// Stop distances straight from the feed's `shape_dist_traveled` columns,
/// rescaled into meters against the polyline length. `None` unless every
/// stop_time carries a value and the shape declares a positive total.
fn distances_from_feed_dist(
    store: &StaticStore,
    trip_id: &str,
    polyline_length_m: f64,
) -> Option<Vec<f64>> {
    let trip = store.trips.get(trip_id)?;
    let shape_points = store.shapes.get(trip.shape_id.as_deref()?)?;
    let total = shape_points
        .last()?
        .dist_traveled
        .filter(|d| *d > 0.0)?;
    let scale = polyline_length_m / total;

    store
        .stop_times_for_trip(trip_id)
        .iter()
        .map(|st| st.shape_dist_traveled.map(|d| d * scale))
        .collect()
}

/// Cumulative distance along the trip for each stop_time, in stop order.
///
/// Feed-provided `shape_dist_traveled` wins when complete; otherwise each
/// stop is projected onto the shape, or distances accumulate over
/// straight-line hops between stops when no shape exists.
pub fn stop_distances_along_trip(store: &StaticStore, trip_id: &str) -> Vec<f64> {
    let stop_times = store.stop_times_for_trip(trip_id);
    let polyline = store.trip_polyline(trip_id);

    if polyline.len() >= 2 {
        if let Some(distances) =
            distances_from_feed_dist(store, trip_id, geo::polyline_length(&polyline))
        {
            return distances;
        }
        let mut last = 0.0_f64;
        return stop_times
            .iter()
            .map(|st| {
                let along = store
                    .stops
                    .get(&st.stop_id)
                    .and_then(|stop| geo::distance_along_polyline(stop.lat, stop.lon, &polyline))
                    .unwrap_or(last);
                // Projection can jitter backwards on self-overlapping shapes
                last = along.max(last);
                last
            })
            .collect();
    }

    let coords = stop_coords(store, trip_id);
    let mut distances = Vec::with_capacity(stop_times.len());
    let mut total = 0.0;
    for (i, coord) in coords.iter().enumerate() {
        if i > 0 {
            let prev = coords[i - 1];
            total += geo::haversine(prev.0, prev.1, coord.0, coord.1);
        }
        distances.push(total);
    }
    // Stops with no coordinates at the tail inherit the last known distance
    while distances.len() < stop_times.len() {
        distances.push(total);
    }
    distances
}

fn stop_coords(store: &StaticStore, trip_id: &str) -> Vec<(f64, f64)> {
    store
        .stop_times_for_trip(trip_id)
        .iter()
        .filter_map(|st| store.stops.get(&st.stop_id).map(|s| (s.lat, s.lon)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::gtfs::static_data::{test_fixtures, StopTime, Trip};
    use chrono::NaiveDate;
    use chrono_tz::America::Los_Angeles;

    fn monday() -> ServiceDay {
        ServiceDay::from_date(Los_Angeles, NaiveDate::from_ymd_opt(2024, 6, 10).unwrap())
    }

    fn saturday() -> ServiceDay {
        ServiceDay::from_date(Los_Angeles, NaiveDate::from_ymd_opt(2024, 6, 8).unwrap())
    }

    #[test]
    fn test_block_ordering_by_start_time() {
        let store = test_fixtures::store();
        let layout = BlockLayout::for_block(&store, "blk1", monday());

        let order: Vec<(&str, u32)> = layout
            .trips
            .iter()
            .map(|t| (t.trip_id.as_str(), t.sequence))
            .collect();
        assert_eq!(order, [("trip_0800", 0), ("trip_1000", 1)]);
    }

    #[test]
    fn test_block_sequences_are_dense() {
        let store = test_fixtures::store();
        let layout = BlockLayout::for_block(&store, "blk1", monday());
        let sequences: Vec<u32> = layout.trips.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, (0..layout.trips.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_block_layout_deterministic() {
        let store = test_fixtures::store();
        let a = BlockLayout::for_block(&store, "blk1", monday());
        let b = BlockLayout::for_block(&store, "blk1", monday());
        let seq = |l: &BlockLayout| -> Vec<(String, u32)> {
            l.trips.iter().map(|t| (t.trip_id.clone(), t.sequence)).collect()
        };
        assert_eq!(seq(&a), seq(&b));
    }

    #[test]
    fn test_block_tie_broken_by_trip_id() {
        let mut store = test_fixtures::store();
        // Same 08:00 start as trip_0800
        store.trips.insert(
            "trip_0800b".to_string(),
            Trip {
                trip_id: "trip_0800b".to_string(),
                route_id: "route_g".to_string(),
                service_id: "weekday".to_string(),
                headsign: None,
                direction_id: Some(0),
                block_id: Some("blk1".to_string()),
                shape_id: None,
            },
        );
        store.stop_times.insert(
            "trip_0800b".to_string(),
            vec![StopTime {
                stop_sequence: 1,
                stop_id: "22005".to_string(),
                arrival_secs: Some(8 * 3600),
                departure_secs: Some(8 * 3600),
                stop_headsign: None,
                pickup_type: 0,
                drop_off_type: 0,
                shape_dist_traveled: None,
            }],
        );
        store.trips_by_block.get_mut("blk1").unwrap().push("trip_0800b".to_string());

        let layout = BlockLayout::for_block(&store, "blk1", monday());
        let order: Vec<&str> = layout.trips.iter().map(|t| t.trip_id.as_str()).collect();
        assert_eq!(order, ["trip_0800", "trip_0800b", "trip_1000"]);
    }

    #[test]
    fn test_block_inactive_day_is_empty() {
        let store = test_fixtures::store();
        let layout = BlockLayout::for_block(&store, "blk1", saturday());
        assert!(layout.trips.is_empty());
        assert_eq!(layout.sequence_or_default("trip_0800"), 0);
    }

    #[test]
    fn test_trip_without_stop_times_dropped() {
        let mut store = test_fixtures::store();
        store.trips.insert(
            "trip_empty".to_string(),
            Trip {
                trip_id: "trip_empty".to_string(),
                route_id: "route_g".to_string(),
                service_id: "weekday".to_string(),
                headsign: None,
                direction_id: None,
                block_id: Some("blk1".to_string()),
                shape_id: None,
            },
        );
        store.trips_by_block.get_mut("blk1").unwrap().push("trip_empty".to_string());

        let layout = BlockLayout::for_block(&store, "blk1", monday());
        assert!(layout.entry("trip_empty").is_none());
        assert_eq!(layout.trips.len(), 2);
    }

    #[test]
    fn test_blockless_trip_is_singleton() {
        let store = test_fixtures::store();
        let layout = BlockLayout::for_trip(&store, "trip_solo", monday());
        assert_eq!(layout.block_id, None);
        assert_eq!(layout.trips.len(), 1);
        let entry = &layout.trips[0];
        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.distance_offset_m, 0.0);
        assert_eq!(entry.stop_offset, 0);
    }

    #[test]
    fn test_cumulative_distances_and_stop_offsets() {
        let store = test_fixtures::store();
        let layout = BlockLayout::for_block(&store, "blk1", monday());

        let first = layout.entry("trip_0800").unwrap();
        let second = layout.entry("trip_1000").unwrap();
        assert_eq!(first.distance_offset_m, 0.0);
        assert!(first.trip_length_m > 0.0);
        assert!((second.distance_offset_m - first.trip_length_m).abs() < 1e-9);
        assert_eq!(second.stop_offset, 3);
    }

    #[test]
    fn test_previous_and_next_trip() {
        let store = test_fixtures::store();
        let layout = BlockLayout::for_block(&store, "blk1", monday());
        assert!(layout.previous_trip("trip_0800").is_none());
        assert_eq!(layout.next_trip("trip_0800").unwrap().trip_id, "trip_1000");
        assert_eq!(layout.previous_trip("trip_1000").unwrap().trip_id, "trip_0800");
        assert!(layout.next_trip("trip_1000").is_none());
    }

    #[test]
    fn test_stop_distances_monotone() {
        let store = test_fixtures::store();
        let with_shape = stop_distances_along_trip(&store, "trip_0800");
        assert_eq!(with_shape.len(), 3);
        assert!(with_shape.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(with_shape[0], 0.0);

        // Without a shape the fallback accumulates stop-to-stop hops
        let mut store = store;
        store.trips.get_mut("trip_0800").unwrap().shape_id = None;
        let fallback = stop_distances_along_trip(&store, "trip_0800");
        assert_eq!(fallback.len(), 3);
        assert!(fallback.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_feed_shape_dist_wins_when_complete() {
        let mut store = test_fixtures::store();
        // Feed declares the shape as 4 units long with stops at 0, 1, 4
        if let Some(points) = store.shapes.get_mut("shp1") {
            for (point, dist) in points.iter_mut().zip([0.0, 2.0, 4.0]) {
                point.dist_traveled = Some(dist);
            }
        }
        for (st, dist) in store
            .stop_times
            .get_mut("trip_0800")
            .unwrap()
            .iter_mut()
            .zip([0.0, 1.0, 4.0])
        {
            st.shape_dist_traveled = Some(dist);
        }

        let total = trip_shape_length_m(&store, "trip_0800");
        let distances = stop_distances_along_trip(&store, "trip_0800");
        assert_eq!(distances[0], 0.0);
        // Stop two sits a quarter of the way along, in feed units
        assert!((distances[1] - total / 4.0).abs() < 1e-6);
        assert!((distances[2] - total).abs() < 1e-6);
    }

    #[test]
    fn test_incomplete_feed_shape_dist_falls_back_to_projection() {
        let mut store = test_fixtures::store();
        if let Some(points) = store.shapes.get_mut("shp1") {
            for (point, dist) in points.iter_mut().zip([0.0, 2.0, 4.0]) {
                point.dist_traveled = Some(dist);
            }
        }
        // Only one stop_time carries a value
        store.stop_times.get_mut("trip_0800").unwrap()[0].shape_dist_traveled = Some(0.0);

        let distances = stop_distances_along_trip(&store, "trip_0800");
        assert_eq!(distances.len(), 3);
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_shape_length_fallback_to_stop_hops() {
        let mut store = test_fixtures::store();
        store.trips.get_mut("trip_solo").unwrap().shape_id = None;
        let length = trip_shape_length_m(&store, "trip_solo");
        assert!(length > 2000.0, "stop hops should span kilometers, got {length}");
    }
}
