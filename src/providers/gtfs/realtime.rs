//! GTFS-RT feed decoding into an immutable snapshot.
//!
//! Each successful poll builds a fresh [`RealtimeSnapshot`] from the protobuf
//! feed; the provider swaps it in behind an `Arc`, so request handlers hold a
//! consistent view for their whole lifetime and never see a partial update.

use std::collections::HashMap;

use prost::Message;

use super::error::GtfsError;

/// Maximum allowed protobuf response size (50 MB)
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;

/// Fetch and decode the GTFS-RT protobuf feed.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
) -> Result<gtfs_realtime::FeedMessage, GtfsError> {
    let response = client
        .get(url)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(GtfsError::UpstreamStatus(format!(
            "realtime feed responded HTTP {}",
            response.status()
        )));
    }

    let bytes = response.bytes().await?;

    if bytes.len() > MAX_PROTOBUF_SIZE {
        return Err(GtfsError::UpstreamStatus(format!(
            "realtime feed is {} bytes, over the {} byte cap",
            bytes.len(),
            MAX_PROTOBUF_SIZE
        )));
    }

    gtfs_realtime::FeedMessage::decode(bytes.as_ref()).map_err(GtfsError::from)
}

/// A vehicle position report.
#[derive(Debug, Clone)]
pub struct VehicleRecord {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    /// Compass bearing, degrees clockwise from north
    pub bearing: Option<f64>,
    /// 1-based GTFS stop_sequence the vehicle is at or approaching
    pub current_stop_sequence: Option<u32>,
    /// 0 = INCOMING_AT, 1 = STOPPED_AT, 2 = IN_TRANSIT_TO
    pub current_status: Option<i32>,
    pub timestamp_ms: i64,
}

/// Arrival or departure estimate inside a stop-time update.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventEstimate {
    /// Absolute POSIX seconds
    pub time: Option<i64>,
    /// Seconds of delay relative to schedule
    pub delay: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct StopTimeUpdateRecord {
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub arrival: EventEstimate,
    pub departure: EventEstimate,
    /// 1 = SKIPPED
    pub schedule_relationship: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct TripUpdateRecord {
    pub trip_id: String,
    pub vehicle_id: Option<String>,
    pub timestamp_ms: Option<i64>,
    pub stop_time_updates: Vec<StopTimeUpdateRecord>,
}

impl TripUpdateRecord {
    /// The update for a stop, preferring a stop_id match over a 1-based
    /// stop_sequence match.
    pub fn update_for_stop(
        &self,
        stop_id: &str,
        stop_sequence: u32,
    ) -> Option<&StopTimeUpdateRecord> {
        self.stop_time_updates
            .iter()
            .find(|stu| stu.stop_id.as_deref() == Some(stop_id))
            .or_else(|| {
                self.stop_time_updates
                    .iter()
                    .find(|stu| stu.stop_sequence == Some(stop_sequence))
            })
    }
}

/// A service alert window in POSIX milliseconds. `None` means open-ended.
#[derive(Debug, Clone, Copy)]
pub struct ActiveWindow {
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AffectedEntity {
    pub agency_id: Option<String>,
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
    pub trip_id: Option<String>,
}

/// A service alert ("situation" on the wire).
#[derive(Debug, Clone)]
pub struct Situation {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub active_windows: Vec<ActiveWindow>,
    pub affected: Vec<AffectedEntity>,
}

/// Read-mostly snapshot of the latest GTFS-RT feed.
#[derive(Debug, Default)]
pub struct RealtimeSnapshot {
    vehicles_by_trip: HashMap<String, VehicleRecord>,
    vehicles_by_id: HashMap<String, VehicleRecord>,
    trip_updates_by_trip: HashMap<String, TripUpdateRecord>,
    situations: Vec<Situation>,
    situations_by_route: HashMap<String, Vec<usize>>,
    situations_by_stop: HashMap<String, Vec<usize>>,
    situations_by_agency: HashMap<String, Vec<usize>>,
    situations_by_trip: HashMap<String, Vec<usize>>,
    /// Feed header timestamp, milliseconds
    pub timestamp_ms: i64,
}

impl RealtimeSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_feed(feed: &gtfs_realtime::FeedMessage) -> Self {
        let mut snapshot = Self {
            timestamp_ms: feed
                .header
                .timestamp
                .map(|t| t as i64 * 1000)
                .unwrap_or_default(),
            ..Self::default()
        };

        for entity in &feed.entity {
            if let Some(vehicle) = &entity.vehicle {
                snapshot.add_vehicle(vehicle);
            }
            if let Some(trip_update) = &entity.trip_update {
                snapshot.add_trip_update(trip_update);
            }
            if let Some(alert) = &entity.alert {
                snapshot.add_alert(&entity.id, alert);
            }
        }

        snapshot
    }

    fn add_vehicle(&mut self, vp: &gtfs_realtime::VehiclePosition) {
        let Some(position) = &vp.position else {
            return;
        };
        let vehicle_id = vp
            .vehicle
            .as_ref()
            .and_then(|d| d.id.clone())
            .unwrap_or_default();
        let trip_id = vp.trip.as_ref().and_then(|t| t.trip_id.clone());

        let record = VehicleRecord {
            vehicle_id: vehicle_id.clone(),
            trip_id: trip_id.clone(),
            lat: position.latitude as f64,
            lon: position.longitude as f64,
            bearing: position.bearing.map(|b| b as f64),
            current_stop_sequence: vp.current_stop_sequence,
            current_status: vp.current_status,
            timestamp_ms: vp.timestamp.map(|t| t as i64 * 1000).unwrap_or_default(),
        };

        if let Some(trip_id) = trip_id {
            self.vehicles_by_trip.insert(trip_id, record.clone());
        }
        if !vehicle_id.is_empty() {
            self.vehicles_by_id.insert(vehicle_id, record);
        }
    }

    fn add_trip_update(&mut self, tu: &gtfs_realtime::TripUpdate) {
        let Some(trip_id) = tu.trip.trip_id.clone() else {
            return;
        };

        let stop_time_updates = tu
            .stop_time_update
            .iter()
            .map(|stu| StopTimeUpdateRecord {
                stop_id: stu.stop_id.clone(),
                stop_sequence: stu.stop_sequence,
                arrival: event_estimate(stu.arrival.as_ref()),
                departure: event_estimate(stu.departure.as_ref()),
                schedule_relationship: stu.schedule_relationship,
            })
            .collect();

        let record = TripUpdateRecord {
            trip_id: trip_id.clone(),
            vehicle_id: tu.vehicle.as_ref().and_then(|d| d.id.clone()),
            timestamp_ms: tu.timestamp.map(|t| t as i64 * 1000),
            stop_time_updates,
        };

        self.trip_updates_by_trip.insert(trip_id, record);
    }

    fn add_alert(&mut self, entity_id: &str, alert: &gtfs_realtime::Alert) {
        let idx = self.situations.len();

        let affected: Vec<AffectedEntity> = alert
            .informed_entity
            .iter()
            .map(|sel| AffectedEntity {
                agency_id: sel.agency_id.clone(),
                route_id: sel.route_id.clone(),
                stop_id: sel.stop_id.clone(),
                trip_id: sel.trip.as_ref().and_then(|t| t.trip_id.clone()),
            })
            .collect();

        for entity in &affected {
            if let Some(route_id) = &entity.route_id {
                self.situations_by_route.entry(route_id.clone()).or_default().push(idx);
            }
            if let Some(stop_id) = &entity.stop_id {
                self.situations_by_stop.entry(stop_id.clone()).or_default().push(idx);
            }
            if let Some(agency_id) = &entity.agency_id {
                self.situations_by_agency.entry(agency_id.clone()).or_default().push(idx);
            }
            if let Some(trip_id) = &entity.trip_id {
                self.situations_by_trip.entry(trip_id.clone()).or_default().push(idx);
            }
        }

        self.situations.push(Situation {
            id: entity_id.to_string(),
            summary: translated_text(alert.header_text.as_ref()),
            description: translated_text(alert.description_text.as_ref()),
            url: translated_text(alert.url.as_ref()),
            active_windows: alert
                .active_period
                .iter()
                .map(|range| ActiveWindow {
                    from_ms: range.start.map(|s| s as i64 * 1000),
                    to_ms: range.end.map(|e| e as i64 * 1000),
                })
                .collect(),
            affected,
        });
    }

    pub fn vehicle_for_trip(&self, trip_id: &str) -> Option<&VehicleRecord> {
        self.vehicles_by_trip.get(trip_id)
    }

    pub fn vehicle_by_id(&self, vehicle_id: &str) -> Option<&VehicleRecord> {
        self.vehicles_by_id.get(vehicle_id)
    }

    pub fn trip_update_for_trip(&self, trip_id: &str) -> Option<&TripUpdateRecord> {
        self.trip_updates_by_trip.get(trip_id)
    }

    pub fn situation(&self, id: &str) -> Option<&Situation> {
        self.situations.iter().find(|s| s.id == id)
    }

    pub fn situations_for_route(&self, route_id: &str) -> Vec<&Situation> {
        self.collect(&self.situations_by_route, route_id)
    }

    pub fn situations_for_stop(&self, stop_id: &str) -> Vec<&Situation> {
        self.collect(&self.situations_by_stop, stop_id)
    }

    pub fn situations_for_agency(&self, agency_id: &str) -> Vec<&Situation> {
        self.collect(&self.situations_by_agency, agency_id)
    }

    pub fn situations_for_trip(&self, trip_id: &str) -> Vec<&Situation> {
        self.collect(&self.situations_by_trip, trip_id)
    }

    fn collect<'a>(&'a self, index: &'a HashMap<String, Vec<usize>>, key: &str) -> Vec<&'a Situation> {
        index
            .get(key)
            .map(|indices| indices.iter().map(|&i| &self.situations[i]).collect())
            .unwrap_or_default()
    }
}

fn event_estimate(event: Option<&gtfs_realtime::trip_update::StopTimeEvent>) -> EventEstimate {
    match event {
        Some(e) => EventEstimate {
            time: e.time,
            delay: e.delay,
        },
        None => EventEstimate::default(),
    }
}

fn translated_text(text: Option<&gtfs_realtime::TranslatedString>) -> Option<String> {
    text.and_then(|t| t.translation.first())
        .map(|tr| tr.text.clone())
        .filter(|s| !s.is_empty())
}
