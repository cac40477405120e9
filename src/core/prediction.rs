//! Fusing a schedule row with real-time data.
//!
//! Predictions are `Option` here; the JSON encoder collapses `None` to the
//! wire's `0` sentinel.

use crate::providers::gtfs::realtime::{EventEstimate, TripUpdateRecord};

/// Outcome of fusing one schedule row with the matching real-time state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub arrival_ms: Option<i64>,
    pub departure_ms: Option<i64>,
    pub predicted: bool,
}

impl Prediction {
    pub fn none() -> Self {
        Self {
            arrival_ms: None,
            departure_ms: None,
            predicted: false,
        }
    }
}

/// Offset of an estimate against its scheduled time, in milliseconds.
/// Absolute times win over relative delays.
fn offset_ms(estimate: &EventEstimate, scheduled_ms: i64) -> Option<i64> {
    if let Some(time) = estimate.time {
        return Some(time * 1000 - scheduled_ms);
    }
    estimate.delay.map(|d| i64::from(d) * 1000)
}

/// Fuse one stop event with the trip's real-time state.
///
/// The matching stop-time update is chosen by stop_id first, then by the
/// 1-based stop_sequence. With no matching update, a tracked vehicle still
/// marks the event predicted at its scheduled times; with nothing at all the
/// event is unpredicted.
///
/// When the scheduled arrival and departure coincide, a single known offset
/// applies to both sides and the two predictions are equal. Otherwise the
/// sides are predicted independently and a missing offset falls back to its
/// own scheduled time, never to the other side's offset.
pub fn fuse(
    scheduled_arrival_ms: i64,
    scheduled_departure_ms: i64,
    stop_id: &str,
    stop_sequence: u32,
    trip_update: Option<&TripUpdateRecord>,
    has_vehicle: bool,
) -> Prediction {
    let matched = trip_update
        .and_then(|tu| tu.update_for_stop(stop_id, stop_sequence))
        // A SKIPPED stop has no usable estimate
        .filter(|stu| stu.schedule_relationship != Some(1));

    let (arrival_offset, departure_offset) = match matched {
        Some(stu) => (
            offset_ms(&stu.arrival, scheduled_arrival_ms),
            offset_ms(&stu.departure, scheduled_departure_ms),
        ),
        None => (None, None),
    };

    if arrival_offset.is_none() && departure_offset.is_none() {
        if has_vehicle {
            // A tracked vehicle with no usable update: live, but on schedule
            return Prediction {
                arrival_ms: Some(scheduled_arrival_ms),
                departure_ms: Some(scheduled_departure_ms),
                predicted: true,
            };
        }
        return Prediction::none();
    }

    if scheduled_arrival_ms == scheduled_departure_ms {
        let offset = arrival_offset.or(departure_offset).unwrap_or(0);
        let at = scheduled_arrival_ms + offset;
        return Prediction {
            arrival_ms: Some(at),
            departure_ms: Some(at),
            predicted: true,
        };
    }

    Prediction {
        arrival_ms: Some(scheduled_arrival_ms + arrival_offset.unwrap_or(0)),
        departure_ms: Some(scheduled_departure_ms + departure_offset.unwrap_or(0)),
        predicted: true,
    }
}
