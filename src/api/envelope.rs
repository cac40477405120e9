//! The OBA wire format: response envelope, reference set, and the shared
//! entity DTOs.
//!
//! Every response is `{code, currentTime, text, version, data}`, and every
//! entity ID inside `data` must also appear in the closed reference set
//! `{agencies, routes, situations, stopTimes, stops, trips}` of the same
//! response. The `0` sentinels for absent predictions exist only here;
//! upstream the values are `Option`.

use std::collections::BTreeSet;

use serde::Serialize;
use utoipa::ToSchema;

use crate::core::arrivals::ArrivalDeparture;
use crate::core::trip_status::TripStatusInfo;
use crate::ids;
use crate::providers::gtfs::realtime::{RealtimeSnapshot, Situation};
use crate::providers::gtfs::static_data::StaticStore;

pub const API_VERSION: i32 = 2;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T: Serialize> {
    pub code: i32,
    pub current_time: i64,
    pub text: String,
    pub version: i32,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(current_time: i64, data: T) -> Self {
        Self {
            code: 200,
            current_time,
            text: "OK".to_string(),
            version: API_VERSION,
            data: Some(data),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryData<T: Serialize> {
    pub entry: T,
    pub references: References,
}

// --- Reference DTOs ---

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgencyRef {
    pub id: String,
    pub name: String,
    pub url: String,
    pub timezone: String,
    pub lang: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteRef {
    pub id: String,
    pub agency_id: String,
    pub short_name: String,
    pub long_name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub route_type: i32,
    pub color: String,
    pub text_color: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopRef {
    pub id: String,
    pub code: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Compass label; absent directions surface as "UNKNOWN" here, at the
    /// single mapping site
    pub direction: String,
    pub location_type: i32,
    pub wheelchair_boarding: String,
    pub parent: String,
    pub route_ids: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TripRef {
    pub id: String,
    pub route_id: String,
    pub service_id: String,
    pub trip_headsign: String,
    pub direction_id: String,
    pub block_id: String,
    pub shape_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindowRef {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AffectsRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SituationRef {
    pub id: String,
    pub creation_time: i64,
    pub active_windows: Vec<TimeWindowRef>,
    pub summary: String,
    pub description: String,
    pub url: String,
    pub all_affects: Vec<AffectsRef>,
}

/// The closed reference set. `stopTimes` is always empty on this surface
/// but stays in the shape for client compatibility.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct References {
    pub agencies: Vec<AgencyRef>,
    pub routes: Vec<RouteRef>,
    pub situations: Vec<SituationRef>,
    pub stop_times: Vec<serde_json::Value>,
    pub stops: Vec<StopRef>,
    pub trips: Vec<TripRef>,
}

// --- Entity DTOs shared across endpoints ---

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PositionDto {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TripStatusDto {
    pub active_trip_id: String,
    pub block_trip_sequence: u32,
    pub service_date: i64,
    pub phase: String,
    pub status: String,
    pub predicted: bool,
    pub scheduled: bool,
    pub position: PositionDto,
    pub last_known_location: PositionDto,
    pub orientation: f64,
    pub last_known_orientation: f64,
    pub closest_stop: String,
    pub closest_stop_time_offset: i64,
    pub next_stop: String,
    pub next_stop_time_offset: i64,
    pub distance_along_trip: f64,
    pub total_distance_along_trip: f64,
    pub scheduled_distance_along_trip: f64,
    pub schedule_deviation: i64,
    pub vehicle_id: String,
    pub last_update_time: i64,
    pub last_location_update_time: i64,
    pub situation_ids: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalAndDepartureDto {
    pub route_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub trip_id: String,
    pub trip_headsign: String,
    pub stop_id: String,
    pub service_date: i64,
    pub scheduled_arrival_time: i64,
    pub scheduled_departure_time: i64,
    /// 0 = no prediction
    pub predicted_arrival_time: i64,
    pub predicted_departure_time: i64,
    pub predicted: bool,
    pub stop_sequence: u32,
    pub total_stops_in_trip: u32,
    pub number_of_stops_away: i32,
    pub block_trip_sequence: u32,
    pub distance_from_stop: f64,
    pub vehicle_id: String,
    pub last_update_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_status: Option<TripStatusDto>,
    pub situation_ids: Vec<String>,
}

/// Combined ID for an entity owned by a trip's agency, empty for unknowns.
fn combined_for_trip(store: &StaticStore, trip_id: &str) -> String {
    match store.agency_for_trip(trip_id) {
        Some(agency) => ids::form(&agency.agency_id, trip_id),
        None => trip_id.to_string(),
    }
}

fn combined_for_route(store: &StaticStore, route_id: &str) -> String {
    match store.agency_for_route(route_id) {
        Some(agency) => ids::form(&agency.agency_id, route_id),
        None => route_id.to_string(),
    }
}

/// Stops take their agency from the first route serving them, falling back
/// to the feed's default agency.
fn agency_for_stop<'a>(store: &'a StaticStore, stop_id: &str) -> Option<&'a str> {
    let mut trips: Vec<&String> = store.trips_at_stop(stop_id).collect();
    trips.sort();
    trips
        .first()
        .and_then(|trip_id| store.agency_for_trip(trip_id.as_str()))
        .or_else(|| store.default_agency())
        .map(|a| a.agency_id.as_str())
}

fn combined_for_stop(store: &StaticStore, stop_id: &str) -> String {
    match agency_for_stop(store, stop_id) {
        Some(agency_id) => ids::form(agency_id, stop_id),
        None => stop_id.to_string(),
    }
}

/// Public form of the stop-ID combiner for handlers that emit bare stop IDs
/// (e.g. `nearbyStopIds`).
pub fn combined_stop_id(store: &StaticStore, stop_id: &str) -> String {
    combined_for_stop(store, stop_id)
}

pub fn combined_trip_id(store: &StaticStore, trip_id: &str) -> String {
    combined_for_trip(store, trip_id)
}

pub fn combined_route_id(store: &StaticStore, route_id: &str) -> String {
    combined_for_route(store, route_id)
}

/// Vehicle IDs share the agency prefix of the trip they serve.
fn combined_for_vehicle(store: &StaticStore, trip_id: &str, vehicle_id: &str) -> String {
    match store.agency_for_trip(trip_id) {
        Some(agency) => ids::form(&agency.agency_id, vehicle_id),
        None => vehicle_id.to_string(),
    }
}

impl TripStatusDto {
    pub fn from_info(store: &StaticStore, info: &TripStatusInfo) -> Self {
        let position = info
            .position
            .map(|(lat, lon)| PositionDto { lat, lon })
            .unwrap_or(PositionDto { lat: 0.0, lon: 0.0 });
        Self {
            active_trip_id: combined_for_trip(store, &info.active_trip_id),
            block_trip_sequence: info.block_trip_sequence,
            service_date: info.service_date_ms,
            phase: info.phase.to_string(),
            status: info.status.to_string(),
            predicted: info.predicted,
            scheduled: info.scheduled,
            last_known_location: PositionDto { lat: position.lat, lon: position.lon },
            position,
            orientation: info.orientation_deg,
            last_known_orientation: info.orientation_deg,
            closest_stop: info
                .closest_stop
                .as_deref()
                .map(|s| combined_for_stop(store, s))
                .unwrap_or_default(),
            closest_stop_time_offset: info.closest_stop_time_offset_s,
            next_stop: info
                .next_stop
                .as_deref()
                .map(|s| combined_for_stop(store, s))
                .unwrap_or_default(),
            next_stop_time_offset: info.next_stop_time_offset_s,
            distance_along_trip: info.distance_along_trip_m,
            total_distance_along_trip: info.total_distance_along_trip_m,
            scheduled_distance_along_trip: info.scheduled_distance_along_trip_m,
            schedule_deviation: info.schedule_deviation_s,
            vehicle_id: info
                .vehicle_id
                .as_deref()
                .map(|v| combined_for_vehicle(store, &info.active_trip_id, v))
                .unwrap_or_default(),
            last_update_time: info.last_update_ms,
            last_location_update_time: info.last_location_update_ms,
            situation_ids: info.situation_ids.clone(),
        }
    }
}

impl ArrivalAndDepartureDto {
    pub fn from_core(store: &StaticStore, ad: &ArrivalDeparture) -> Self {
        Self {
            route_id: combined_for_route(store, &ad.route_id),
            route_short_name: ad.route_short_name.clone().unwrap_or_default(),
            route_long_name: ad.route_long_name.clone().unwrap_or_default(),
            trip_id: combined_for_trip(store, &ad.trip_id),
            trip_headsign: ad.trip_headsign.clone().unwrap_or_default(),
            stop_id: combined_for_stop(store, &ad.stop_id),
            service_date: ad.service_date_ms,
            scheduled_arrival_time: ad.scheduled_arrival_ms,
            scheduled_departure_time: ad.scheduled_departure_ms,
            predicted_arrival_time: ad.predicted_arrival_ms.unwrap_or(0),
            predicted_departure_time: ad.predicted_departure_ms.unwrap_or(0),
            predicted: ad.predicted,
            stop_sequence: ad.stop_sequence,
            total_stops_in_trip: ad.total_stops_in_trip,
            number_of_stops_away: ad.number_of_stops_away,
            block_trip_sequence: ad.block_trip_sequence,
            distance_from_stop: ad.distance_from_stop_m,
            vehicle_id: ad
                .vehicle_id
                .as_deref()
                .map(|v| combined_for_vehicle(store, &ad.trip_id, v))
                .unwrap_or_default(),
            last_update_time: ad.last_update_ms,
            trip_status: ad
                .trip_status
                .as_ref()
                .map(|info| TripStatusDto::from_info(store, info)),
            situation_ids: ad.situation_ids.clone(),
        }
    }
}

// --- Reference set construction ---

/// Collects referenced native IDs, then materializes the closed reference
/// set. Adding a trip pulls in its route; adding a route pulls in its
/// agency; a failed auxiliary lookup skips that element rather than failing
/// the response.
pub struct ReferencesBuilder<'a> {
    store: &'a StaticStore,
    snapshot: &'a RealtimeSnapshot,
    agency_ids: BTreeSet<String>,
    route_ids: BTreeSet<String>,
    stop_ids: BTreeSet<String>,
    trip_ids: BTreeSet<String>,
    situation_ids: BTreeSet<String>,
}

impl<'a> ReferencesBuilder<'a> {
    pub fn new(store: &'a StaticStore, snapshot: &'a RealtimeSnapshot) -> Self {
        Self {
            store,
            snapshot,
            agency_ids: BTreeSet::new(),
            route_ids: BTreeSet::new(),
            stop_ids: BTreeSet::new(),
            trip_ids: BTreeSet::new(),
            situation_ids: BTreeSet::new(),
        }
    }

    pub fn add_agency(&mut self, agency_id: &str) {
        self.agency_ids.insert(agency_id.to_string());
    }

    pub fn add_route(&mut self, route_id: &str) {
        if self.route_ids.insert(route_id.to_string()) {
            if let Some(agency) = self.store.agency_for_route(route_id) {
                let id = agency.agency_id.clone();
                self.add_agency(&id);
            }
        }
    }

    pub fn add_trip(&mut self, trip_id: &str) {
        if self.trip_ids.insert(trip_id.to_string()) {
            if let Some(trip) = self.store.trips.get(trip_id) {
                let route_id = trip.route_id.clone();
                self.add_route(&route_id);
            }
        }
    }

    pub fn add_stop(&mut self, stop_id: &str) {
        if self.stop_ids.insert(stop_id.to_string()) {
            // Routes serving the stop appear in the stop reference, so they
            // must close over the set too
            let mut route_ids: BTreeSet<String> = BTreeSet::new();
            for trip_id in self.store.trips_at_stop(stop_id) {
                if let Some(trip) = self.store.trips.get(trip_id) {
                    route_ids.insert(trip.route_id.clone());
                }
            }
            for route_id in route_ids {
                self.add_route(&route_id);
            }
        }
    }

    pub fn add_situation(&mut self, situation_id: &str) {
        self.situation_ids.insert(situation_id.to_string());
    }

    /// Everything an assembled arrival mentions.
    pub fn add_arrival(&mut self, ad: &ArrivalDeparture) {
        self.add_route(&ad.route_id);
        self.add_trip(&ad.trip_id);
        self.add_stop(&ad.stop_id);
        for id in &ad.situation_ids {
            self.add_situation(id);
        }
        if let Some(status) = &ad.trip_status {
            self.add_trip_status(status);
        }
    }

    pub fn add_trip_status(&mut self, status: &TripStatusInfo) {
        self.add_trip(&status.active_trip_id);
        if let Some(stop) = status.closest_stop.clone() {
            self.add_stop(&stop);
        }
        if let Some(stop) = status.next_stop.clone() {
            self.add_stop(&stop);
        }
        for id in status.situation_ids.clone() {
            self.add_situation(&id);
        }
    }

    pub fn build(self) -> References {
        let store = self.store;

        let agencies = self
            .agency_ids
            .iter()
            .filter_map(|id| store.agency(id))
            .map(|agency| AgencyRef {
                id: agency.agency_id.clone(),
                name: agency.name.clone(),
                url: agency.url.clone().unwrap_or_default(),
                timezone: agency.timezone.clone(),
                lang: agency.lang.clone().unwrap_or_default(),
            })
            .collect();

        let routes = self
            .route_ids
            .iter()
            .filter_map(|id| store.routes.get(id))
            .map(|route| RouteRef {
                id: combined_for_route(store, &route.route_id),
                agency_id: store
                    .agency_for_route(&route.route_id)
                    .map(|a| a.agency_id.clone())
                    .unwrap_or_default(),
                short_name: route.short_name.clone().unwrap_or_default(),
                long_name: route.long_name.clone().unwrap_or_default(),
                description: route.description.clone().unwrap_or_default(),
                route_type: route.route_type,
                color: route.color.clone().unwrap_or_default(),
                text_color: route.text_color.clone().unwrap_or_default(),
            })
            .collect();

        let stops = self
            .stop_ids
            .iter()
            .filter_map(|id| store.stops.get(id))
            .map(|stop| {
                let mut route_ids: BTreeSet<String> = BTreeSet::new();
                for trip_id in store.trips_at_stop(&stop.stop_id) {
                    if let Some(trip) = store.trips.get(trip_id) {
                        route_ids.insert(combined_for_route(store, &trip.route_id));
                    }
                }
                StopRef {
                    id: combined_for_stop(store, &stop.stop_id),
                    code: stop.code.clone().unwrap_or_default(),
                    name: stop.name.clone().unwrap_or_default(),
                    lat: stop.lat,
                    lon: stop.lon,
                    direction: stop
                        .direction
                        .clone()
                        .unwrap_or_else(|| "UNKNOWN".to_string()),
                    location_type: stop.location_type,
                    wheelchair_boarding: stop.wheelchair_boarding.as_str().to_string(),
                    parent: stop
                        .parent_station
                        .as_deref()
                        .map(|p| combined_for_stop(store, p))
                        .unwrap_or_default(),
                    route_ids: route_ids.into_iter().collect(),
                }
            })
            .collect();

        let trips = self
            .trip_ids
            .iter()
            .filter_map(|id| store.trips.get(id))
            .map(|trip| TripRef {
                id: combined_for_trip(store, &trip.trip_id),
                route_id: combined_for_route(store, &trip.route_id),
                service_id: trip.service_id.clone(),
                trip_headsign: trip.headsign.clone().unwrap_or_default(),
                direction_id: trip
                    .direction_id
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                block_id: trip.block_id.clone().unwrap_or_default(),
                shape_id: trip.shape_id.clone().unwrap_or_default(),
            })
            .collect();

        let situations = self
            .situation_ids
            .iter()
            .filter_map(|id| self.snapshot.situation(id))
            .map(|situation| situation_ref(store, situation))
            .collect();

        References {
            agencies,
            routes,
            situations,
            stop_times: Vec::new(),
            stops,
            trips,
        }
    }
}

fn situation_ref(store: &StaticStore, situation: &Situation) -> SituationRef {
    SituationRef {
        id: situation.id.clone(),
        creation_time: 0,
        active_windows: situation
            .active_windows
            .iter()
            .map(|w| TimeWindowRef {
                from: w.from_ms.unwrap_or(0),
                to: w.to_ms.unwrap_or(0),
            })
            .collect(),
        summary: situation.summary.clone().unwrap_or_default(),
        description: situation.description.clone().unwrap_or_default(),
        url: situation.url.clone().unwrap_or_default(),
        all_affects: situation
            .affected
            .iter()
            .map(|a| AffectsRef {
                agency_id: a.agency_id.clone(),
                route_id: a.route_id.as_deref().map(|r| combined_for_route(store, r)),
                stop_id: a.stop_id.as_deref().map(|s| combined_for_stop(store, s)),
                trip_id: a.trip_id.as_deref().map(|t| combined_for_trip(store, t)),
            })
            .collect(),
    }
}
