//! Arrival/departure assembly: the computation behind the
//! arrival-and-departure endpoints.

use std::collections::HashMap;

use chrono_tz::Tz;

use crate::geo;
use crate::providers::gtfs::realtime::{RealtimeSnapshot, VehicleRecord};
use crate::providers::gtfs::static_data::StaticStore;

use super::blocks::BlockLayout;
use super::prediction;
use super::schedule::{self, ScheduleRow};
use super::service_day::ServiceDay;
use super::trip_status::{self, TripStatusInfo};

/// Radius inside which another stop counts as "nearby".
const NEARBY_STOP_RADIUS_M: f64 = 10_000.0;

/// One assembled arrival/departure, ready for wire encoding.
#[derive(Debug, Clone)]
pub struct ArrivalDeparture {
    pub route_id: String,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub trip_id: String,
    pub trip_headsign: Option<String>,
    pub stop_id: String,
    pub service_date_ms: i64,
    pub scheduled_arrival_ms: i64,
    pub scheduled_departure_ms: i64,
    pub predicted_arrival_ms: Option<i64>,
    pub predicted_departure_ms: Option<i64>,
    pub predicted: bool,
    /// 0-based on the wire
    pub stop_sequence: u32,
    pub total_stops_in_trip: u32,
    /// `-1` when no vehicle sequence is known
    pub number_of_stops_away: i32,
    pub block_trip_sequence: u32,
    pub distance_from_stop_m: f64,
    pub vehicle_id: Option<String>,
    pub last_update_ms: i64,
    pub trip_status: Option<TripStatusInfo>,
    pub situation_ids: Vec<String>,
}

/// Per-request cache of block layouts; mode B windows typically repeat the
/// same handful of blocks.
pub struct Assembler<'a> {
    store: &'a StaticStore,
    snapshot: &'a RealtimeSnapshot,
    layouts: HashMap<(String, chrono::NaiveDate), BlockLayout>,
}

impl<'a> Assembler<'a> {
    pub fn new(store: &'a StaticStore, snapshot: &'a RealtimeSnapshot) -> Self {
        Self {
            store,
            snapshot,
            layouts: HashMap::new(),
        }
    }

    fn layout_for(&mut self, block_id: &str, day: ServiceDay) -> &BlockLayout {
        let key = (block_id.to_string(), day.date);
        if !self.layouts.contains_key(&key) {
            let layout = BlockLayout::for_block(self.store, block_id, day);
            self.layouts.insert(key.clone(), layout);
        }
        &self.layouts[&key]
    }

    /// Block sequence for a trip; blockless trips are blocks of one.
    fn block_sequence_for(&mut self, trip_id: &str, day: ServiceDay) -> u32 {
        let block_id = self
            .store
            .trips
            .get(trip_id)
            .and_then(|t| t.block_id.clone());
        match block_id {
            Some(block_id) => self.layout_for(&block_id, day).sequence_or_default(trip_id),
            None => 0,
        }
    }

    /// Mode B: every arrival at a stop inside the absolute window.
    pub fn arrivals_for_stop(
        &mut self,
        tz: Tz,
        stop_id: &str,
        from_ms: i64,
        to_ms: i64,
        now_ms: i64,
    ) -> Vec<ArrivalDeparture> {
        let rows = schedule::rows_for_stop_window(self.store, tz, stop_id, from_ms, to_ms);
        rows.into_iter()
            .map(|row| self.assemble(row, None, now_ms))
            .collect()
    }

    /// Mode A: one trip at one stop on an explicit service day.
    ///
    /// `vehicle_id` pins a vehicle, but is honored only when that vehicle
    /// reports the requested trip.
    pub fn arrival_for_trip(
        &mut self,
        trip_id: &str,
        stop_id: &str,
        stop_sequence: Option<u32>,
        day: ServiceDay,
        vehicle_id: Option<&str>,
        now_ms: i64,
    ) -> Option<ArrivalDeparture> {
        let row = schedule::row_for_trip_at_stop(self.store, trip_id, stop_id, stop_sequence, day)?;

        let pinned = vehicle_id
            .and_then(|id| self.snapshot.vehicle_by_id(id))
            .filter(|v| v.trip_id.as_deref() == Some(trip_id));

        Some(self.assemble(row, pinned, now_ms))
    }

    fn assemble(
        &mut self,
        row: ScheduleRow,
        pinned_vehicle: Option<&VehicleRecord>,
        now_ms: i64,
    ) -> ArrivalDeparture {
        let vehicle = pinned_vehicle.or_else(|| self.snapshot.vehicle_for_trip(&row.trip_id));
        let trip_update = self.snapshot.trip_update_for_trip(&row.trip_id);

        let fused = prediction::fuse(
            row.scheduled_arrival_ms,
            row.scheduled_departure_ms,
            &row.stop_id,
            row.stop_sequence,
            trip_update,
            vehicle.is_some(),
        );

        let number_of_stops_away = match vehicle {
            Some(v) => match v.current_stop_sequence {
                Some(current) => row.stop_sequence as i32 - current as i32 - 1,
                None => -1,
            },
            None => -1,
        };

        let distance_from_stop_m = vehicle
            .map(|v| self.distance_from_stop(&row, v))
            .unwrap_or(0.0);

        let block_trip_sequence = self.block_sequence_for(&row.trip_id, row.service_day);

        let status = trip_status::build_with_vehicle(
            self.store,
            self.snapshot,
            &row.trip_id,
            row.service_day,
            now_ms,
            vehicle,
        );

        let route = self.store.routes.get(&row.route_id);

        let mut situation_ids: Vec<String> = Vec::new();
        for situation in self
            .snapshot
            .situations_for_trip(&row.trip_id)
            .into_iter()
            .chain(self.snapshot.situations_for_route(&row.route_id))
            .chain(self.snapshot.situations_for_stop(&row.stop_id))
        {
            if !situation_ids.contains(&situation.id) {
                situation_ids.push(situation.id.clone());
            }
        }

        ArrivalDeparture {
            route_id: row.route_id.clone(),
            route_short_name: route.and_then(|r| r.short_name.clone()),
            route_long_name: route.and_then(|r| r.long_name.clone()),
            trip_id: row.trip_id.clone(),
            trip_headsign: row.headsign.clone(),
            stop_id: row.stop_id.clone(),
            service_date_ms: row.service_day.epoch_ms(),
            scheduled_arrival_ms: row.scheduled_arrival_ms,
            scheduled_departure_ms: row.scheduled_departure_ms,
            predicted_arrival_ms: fused.arrival_ms.filter(|_| fused.predicted),
            predicted_departure_ms: fused.departure_ms.filter(|_| fused.predicted),
            predicted: fused.predicted,
            stop_sequence: row.stop_sequence.saturating_sub(1),
            total_stops_in_trip: row.total_stops,
            number_of_stops_away,
            block_trip_sequence,
            distance_from_stop_m,
            vehicle_id: vehicle
                .map(|v| v.vehicle_id.clone())
                .filter(|id| !id.is_empty()),
            last_update_ms: vehicle.map(|v| v.timestamp_ms).unwrap_or(0),
            trip_status: status,
            situation_ids,
        }
    }

    /// Distance left to the target stop: along the shape when one exists,
    /// else straight-line vehicle-to-stop.
    fn distance_from_stop(&self, row: &ScheduleRow, vehicle: &VehicleRecord) -> f64 {
        let polyline = self.store.trip_polyline(&row.trip_id);
        let stop = self.store.stops.get(&row.stop_id);

        if polyline.len() >= 2 {
            let stop_along = stop
                .and_then(|s| geo::distance_along_polyline(s.lat, s.lon, &polyline));
            let vehicle_along = geo::distance_along_polyline(vehicle.lat, vehicle.lon, &polyline);
            if let (Some(stop_along), Some(vehicle_along)) = (stop_along, vehicle_along) {
                return stop_along - vehicle_along;
            }
        }

        stop.map(|s| geo::haversine(vehicle.lat, vehicle.lon, s.lat, s.lon))
            .unwrap_or(0.0)
    }
}

/// At most one other stop within 10 km, nearest first. The plural wire name
/// is historical; the cap is intentional.
pub fn nearby_stop(store: &StaticStore, stop_id: &str) -> Option<String> {
    let origin = store.stops.get(stop_id)?;
    store
        .stops
        .values()
        .filter(|s| s.stop_id != stop_id)
        .map(|s| (s, geo::haversine(origin.lat, origin.lon, s.lat, s.lon)))
        .filter(|(_, d)| *d <= NEARBY_STOP_RADIUS_M)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(s, _)| s.stop_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::gtfs::realtime::test_fixtures as rt;
    use crate::providers::gtfs::static_data::test_fixtures;
    use chrono::NaiveDate;
    use chrono_tz::America::Los_Angeles;

    const TZ: chrono_tz::Tz = Los_Angeles;

    fn monday() -> ServiceDay {
        ServiceDay::from_date(TZ, NaiveDate::from_ymd_opt(2024, 6, 10).unwrap())
    }

    #[test]
    fn test_mode_b_sorted_zero_based_with_totals() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        let mut assembler = Assembler::new(&store, &snapshot);

        let day = monday();
        let now = day.time_at_secs(8 * 3600);
        let arrivals = assembler.arrivals_for_stop(
            TZ,
            "22005",
            day.time_at_secs(7 * 3600),
            day.time_at_secs(13 * 3600),
            now,
        );

        assert_eq!(arrivals.len(), 3);
        for pair in arrivals.windows(2) {
            assert!(pair[0].scheduled_arrival_ms <= pair[1].scheduled_arrival_ms);
        }
        for arrival in &arrivals {
            assert!(arrival.total_stops_in_trip > 0);
            // Feed sequence 1 -> exposed 0
            assert_eq!(arrival.stop_sequence, 0);
            assert!(!arrival.predicted);
            assert_eq!(arrival.predicted_arrival_ms, None);
            assert_eq!(arrival.number_of_stops_away, -1);
            assert_eq!(arrival.last_update_ms, 0);
        }
    }

    #[test]
    fn test_mode_b_empty_on_inactive_day() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        let mut assembler = Assembler::new(&store, &snapshot);

        // Saturday: weekday service inactive
        let day = ServiceDay::from_date(TZ, NaiveDate::from_ymd_opt(2024, 6, 8).unwrap());
        let arrivals = assembler.arrivals_for_stop(
            TZ,
            "22005",
            day.time_at_secs(0),
            day.time_at_secs(24 * 3600),
            day.time_at_secs(12 * 3600),
        );
        assert!(arrivals.is_empty());
    }

    #[test]
    fn test_mode_a_finds_requested_sequence() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        let mut assembler = Assembler::new(&store, &snapshot);

        let arrival = assembler
            .arrival_for_trip("trip_0800", "22010", Some(2), monday(), None, 0)
            .unwrap();
        // Internal sequence 2 -> exposed 1
        assert_eq!(arrival.stop_sequence, 1);
        assert_eq!(arrival.trip_id, "trip_0800");

        // No such stop_time
        assert!(assembler
            .arrival_for_trip("trip_0800", "22010", Some(7), monday(), None, 0)
            .is_none());
    }

    #[test]
    fn test_vehicle_fields_flow_through() {
        let store = test_fixtures::store();
        let feed = rt::feed(vec![
            rt::vehicle_entity(
                "e1", "bus42", Some("trip_0800"), 38.5400, -121.7600, None, Some(1), Some(2),
            ),
            rt::trip_update_entity(
                "e2",
                "trip_0800",
                Some("bus42"),
                vec![rt::stop_time_update(Some("22020"), Some(3), Some(60), None, None, None)],
            ),
        ]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let mut assembler = Assembler::new(&store, &snapshot);

        let arrival = assembler
            .arrival_for_trip("trip_0800", "22020", None, monday(), None, 0)
            .unwrap();

        assert!(arrival.predicted);
        assert_eq!(
            arrival.predicted_arrival_ms,
            Some(arrival.scheduled_arrival_ms + 60_000)
        );
        assert_eq!(arrival.vehicle_id.as_deref(), Some("bus42"));
        assert_eq!(arrival.last_update_ms, 1_718_000_100_000);
        // Vehicle at sequence 1, target sequence 3: one stop between
        assert_eq!(arrival.number_of_stops_away, 1);
        // Vehicle at the first stop, target the last: whole trip remaining
        assert!(arrival.distance_from_stop_m > 0.0);
        let status = arrival.trip_status.as_ref().unwrap();
        assert_eq!(status.vehicle_id.as_deref(), Some("bus42"));
    }

    #[test]
    fn test_vehicle_without_sequence_uses_sentinel() {
        let store = test_fixtures::store();
        let feed = rt::feed(vec![rt::vehicle_entity(
            "e1", "bus42", Some("trip_0800"), 38.5400, -121.7600, None, None, Some(2),
        )]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let mut assembler = Assembler::new(&store, &snapshot);

        let arrival = assembler
            .arrival_for_trip("trip_0800", "22020", None, monday(), None, 0)
            .unwrap();
        assert_eq!(arrival.number_of_stops_away, -1);
        // Tracked vehicle, no stop-time update: predicted at schedule
        assert!(arrival.predicted);
        assert_eq!(arrival.predicted_arrival_ms, Some(arrival.scheduled_arrival_ms));
    }

    #[test]
    fn test_mode_a_ignores_vehicle_on_other_trip() {
        let store = test_fixtures::store();
        let feed = rt::feed(vec![rt::vehicle_entity(
            "e1", "bus42", Some("trip_1000"), 38.5400, -121.7600, None, Some(1), Some(2),
        )]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let mut assembler = Assembler::new(&store, &snapshot);

        // bus42 reports trip_1000, so pinning it for trip_0800 is ignored
        let arrival = assembler
            .arrival_for_trip("trip_0800", "22005", None, monday(), Some("bus42"), 0)
            .unwrap();
        assert_eq!(arrival.vehicle_id, None);
        assert!(!arrival.predicted);

        // ...and honored for its own trip
        let arrival = assembler
            .arrival_for_trip("trip_1000", "22005", None, monday(), Some("bus42"), 0)
            .unwrap();
        assert_eq!(arrival.vehicle_id.as_deref(), Some("bus42"));
    }

    #[test]
    fn test_block_trip_sequence_assigned() {
        let store = test_fixtures::store();
        let snapshot = RealtimeSnapshot::empty();
        let mut assembler = Assembler::new(&store, &snapshot);

        let first = assembler
            .arrival_for_trip("trip_0800", "22005", None, monday(), None, 0)
            .unwrap();
        let second = assembler
            .arrival_for_trip("trip_1000", "22005", None, monday(), None, 0)
            .unwrap();
        let solo = assembler
            .arrival_for_trip("trip_solo", "22005", None, monday(), None, 0)
            .unwrap();

        assert_eq!(first.block_trip_sequence, 0);
        assert_eq!(second.block_trip_sequence, 1);
        assert_eq!(solo.block_trip_sequence, 0);
    }

    #[test]
    fn test_situations_attached_to_arrival() {
        let store = test_fixtures::store();
        let feed = rt::feed(vec![rt::alert_entity(
            "alert_stop",
            "Stop closed",
            vec![rt::stop_selector("22005")],
        )]);
        let snapshot = RealtimeSnapshot::from_feed(&feed);
        let mut assembler = Assembler::new(&store, &snapshot);

        let arrival = assembler
            .arrival_for_trip("trip_0800", "22005", None, monday(), None, 0)
            .unwrap();
        assert_eq!(arrival.situation_ids, ["alert_stop"]);
    }

    #[test]
    fn test_nearby_stop_capped_to_nearest() {
        let store = test_fixtures::store();
        // 22010 is the nearest to 22005
        assert_eq!(nearby_stop(&store, "22005").as_deref(), Some("22010"));
        assert!(nearby_stop(&store, "nope").is_none());
    }
}
