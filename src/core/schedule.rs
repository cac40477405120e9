//! Schedule materialization: static stop_times to absolute-time rows.

use chrono_tz::Tz;

use crate::providers::gtfs::static_data::{StaticStore, StopTime};

use super::service_day::ServiceDay;

/// One scheduled arrival/departure at a stop, resolved to absolute epoch
/// milliseconds on a concrete service day.
#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub block_id: Option<String>,
    /// stop_headsign override when present, else the trip headsign
    pub headsign: Option<String>,
    pub stop_id: String,
    /// 1-based feed sequence; the wire boundary subtracts one
    pub stop_sequence: u32,
    pub total_stops: u32,
    /// Seconds since the service day's local midnight
    pub arrival_secs: i32,
    pub departure_secs: i32,
    pub service_day: ServiceDay,
    pub scheduled_arrival_ms: i64,
    pub scheduled_departure_ms: i64,
}

fn build_row(
    store: &StaticStore,
    trip_id: &str,
    st: &StopTime,
    total_stops: u32,
    day: ServiceDay,
) -> Option<ScheduleRow> {
    let trip = store.trips.get(trip_id)?;
    let arrival_secs = st.arrival_or_departure()?;
    let departure_secs = st.departure_or_arrival()?;

    Some(ScheduleRow {
        trip_id: trip.trip_id.clone(),
        route_id: trip.route_id.clone(),
        service_id: trip.service_id.clone(),
        block_id: trip.block_id.clone(),
        headsign: st.stop_headsign.clone().or_else(|| trip.headsign.clone()),
        stop_id: st.stop_id.clone(),
        stop_sequence: st.stop_sequence,
        total_stops,
        arrival_secs,
        departure_secs,
        service_day: day,
        scheduled_arrival_ms: day.time_at_secs(arrival_secs),
        scheduled_departure_ms: day.time_at_secs(departure_secs),
    })
}

/// Service days whose stop_times can land inside `[from_ms, to_ms]`.
///
/// The day before the window start is always considered so trips with times
/// past 24:00:00 stay visible on the following civil day.
fn candidate_days(tz: Tz, from_ms: i64, to_ms: i64) -> Vec<ServiceDay> {
    let mut days: Vec<ServiceDay> = Vec::new();
    let from_day = chrono::DateTime::from_timestamp_millis(from_ms)
        .map(|dt| ServiceDay::containing(tz, dt));
    let to_day =
        chrono::DateTime::from_timestamp_millis(to_ms).map(|dt| ServiceDay::containing(tz, dt));

    if let Some(day) = from_day {
        days.push(day.prev());
        days.push(day);
    }
    if let Some(day) = to_day {
        if !days.iter().any(|d| d.date == day.date) {
            days.push(day);
        }
    }
    days
}

/// Scheduled rows at a stop within an absolute window, filtered to active
/// services and ordered by (arrival, departure, trip_id).
pub fn rows_for_stop_window(
    store: &StaticStore,
    tz: Tz,
    stop_id: &str,
    from_ms: i64,
    to_ms: i64,
) -> Vec<ScheduleRow> {
    let mut rows = Vec::new();

    for day in candidate_days(tz, from_ms, to_ms) {
        let active = store.active_service_ids(day.date);
        if active.is_empty() {
            continue;
        }

        for trip_id in store.trips_at_stop(stop_id) {
            let Some(trip) = store.trips.get(trip_id) else {
                continue;
            };
            if !active.contains(&trip.service_id) {
                continue;
            }

            let stop_times = store.stop_times_for_trip(trip_id);
            let total_stops = stop_times.len() as u32;
            for st in stop_times.iter().filter(|st| st.stop_id == stop_id) {
                let Some(row) = build_row(store, trip_id, st, total_stops, day) else {
                    continue;
                };
                let arrival_in = (from_ms..=to_ms).contains(&row.scheduled_arrival_ms);
                let departure_in = (from_ms..=to_ms).contains(&row.scheduled_departure_ms);
                if arrival_in || departure_in {
                    rows.push(row);
                }
            }
        }
    }

    sort_rows(&mut rows);
    rows
}

/// All scheduled rows at a stop for one service day (the schedule endpoint),
/// regardless of wall-clock window.
pub fn rows_for_stop_on_day(store: &StaticStore, stop_id: &str, day: ServiceDay) -> Vec<ScheduleRow> {
    let active = store.active_service_ids(day.date);
    let mut rows = Vec::new();

    for trip_id in store.trips_at_stop(stop_id) {
        let Some(trip) = store.trips.get(trip_id) else {
            continue;
        };
        if !active.contains(&trip.service_id) {
            continue;
        }
        let stop_times = store.stop_times_for_trip(trip_id);
        let total_stops = stop_times.len() as u32;
        for st in stop_times.iter().filter(|st| st.stop_id == stop_id) {
            if let Some(row) = build_row(store, trip_id, st, total_stops, day) {
                rows.push(row);
            }
        }
    }

    sort_rows(&mut rows);
    rows
}

/// The scheduled row for one trip at one stop on a given service day
/// (mode A lookups). `stop_sequence`, when given, selects among multiple
/// visits to the same stop.
pub fn row_for_trip_at_stop(
    store: &StaticStore,
    trip_id: &str,
    stop_id: &str,
    stop_sequence: Option<u32>,
    day: ServiceDay,
) -> Option<ScheduleRow> {
    let stop_times = store.stop_times_for_trip(trip_id);
    let total_stops = stop_times.len() as u32;

    let at_stop = || stop_times.iter().filter(|st| st.stop_id == stop_id);
    let st = match stop_sequence {
        Some(seq) => at_stop().find(|st| st.stop_sequence == seq)?,
        None => at_stop().next()?,
    };

    build_row(store, trip_id, st, total_stops, day)
}

fn sort_rows(rows: &mut [ScheduleRow]) {
    rows.sort_by(|a, b| {
        a.scheduled_arrival_ms
            .cmp(&b.scheduled_arrival_ms)
            .then(a.scheduled_departure_ms.cmp(&b.scheduled_departure_ms))
            .then(a.trip_id.cmp(&b.trip_id))
    });
}
