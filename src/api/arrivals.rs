//! The two arrival-and-departure endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::arrivals::{self, Assembler};
use crate::core::service_day::ServiceDay;

use super::envelope::{
    ArrivalAndDepartureDto, Envelope, EntryData, ReferencesBuilder,
};
use super::{check_key, now_ms, resolve_time, split_combined, store_for, with_deadline};
use super::{ApiError, AppState};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalsForStopQuery {
    /// Window before `time`, minutes (default 5)
    pub minutes_before: Option<u32>,
    /// Window after `time`, minutes (default 35)
    pub minutes_after: Option<u32>,
    /// Reference instant, epoch milliseconds (default now)
    pub time: Option<i64>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopWithArrivalsAndDeparturesDto {
    pub stop_id: String,
    pub arrivals_and_departures: Vec<ArrivalAndDepartureDto>,
    /// At most one element; plural name kept for wire compatibility
    pub nearby_stop_ids: Vec<String>,
    pub situation_ids: Vec<String>,
}

/// Mode B: every arrival and departure at a stop inside the window.
#[utoipa::path(
    get,
    path = "/api/where/arrivals-and-departures-for-stop/{id}",
    responses(
        (status = 200, description = "Arrivals and departures at the stop"),
        (status = 404, description = "Stop not found", body = super::error::ErrorBody),
        (status = 503, description = "Deadline exceeded", body = super::error::ErrorBody)
    ),
    tag = "where"
)]
pub async fn arrivals_and_departures_for_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArrivalsForStopQuery>,
) -> Result<Json<Envelope<EntryData<StopWithArrivalsAndDeparturesDto>>>, ApiError> {
    let config = state.config.clone();
    with_deadline(&config, async move {
        check_key(&state.config, query.key.as_deref())?;

        let minutes_before = query.minutes_before.unwrap_or(state.config.api.minutes_before);
        let minutes_after = query.minutes_after.unwrap_or(state.config.api.minutes_after);
        if minutes_before > 24 * 60 {
            return Err(ApiError::validation("minutesBefore", "must not exceed one day"));
        }
        if minutes_after > 24 * 60 {
            return Err(ApiError::validation("minutesAfter", "must not exceed one day"));
        }

        let store = store_for(&state).await?;
        let snapshot = state.provider.snapshot().await;

        let (agency_id, stop_id) = split_combined(&id)?;
        let agency = store.agency(agency_id).ok_or(ApiError::NotFound)?;
        if !store.stops.contains_key(stop_id) {
            return Err(ApiError::NotFound);
        }
        let tz = agency.tz();

        let now = now_ms();
        let at = resolve_time(query.time, now)?;
        let from = at - i64::from(minutes_before) * 60_000;
        let to = at + i64::from(minutes_after) * 60_000;

        let mut assembler = Assembler::new(&store, &snapshot);
        let assembled = assembler.arrivals_for_stop(tz, stop_id, from, to, at);

        let mut builder = ReferencesBuilder::new(&store, &snapshot);
        builder.add_agency(agency_id);
        builder.add_stop(stop_id);

        let mut situation_ids = Vec::new();
        for situation in snapshot
            .situations_for_stop(stop_id)
            .into_iter()
            .chain(snapshot.situations_for_agency(agency_id))
        {
            if situation_ids.contains(&situation.id) {
                continue;
            }
            builder.add_situation(&situation.id);
            situation_ids.push(situation.id.clone());
        }

        let nearby = arrivals::nearby_stop(&store, stop_id);
        let nearby_stop_ids = match nearby {
            Some(nearby_id) => {
                builder.add_stop(&nearby_id);
                vec![super::envelope::combined_stop_id(&store, &nearby_id)]
            }
            None => Vec::new(),
        };

        let list: Vec<ArrivalAndDepartureDto> = assembled
            .iter()
            .map(|ad| {
                builder.add_arrival(ad);
                ArrivalAndDepartureDto::from_core(&store, ad)
            })
            .collect();

        let entry = StopWithArrivalsAndDeparturesDto {
            stop_id: super::envelope::combined_stop_id(&store, stop_id),
            arrivals_and_departures: list,
            nearby_stop_ids,
            situation_ids,
        };

        Ok(Json(Envelope::ok(
            now,
            EntryData {
                entry,
                references: builder.build(),
            },
        )))
    })
    .await
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalForStopQuery {
    /// Combined trip ID (required)
    pub trip_id: Option<String>,
    /// Service date, epoch milliseconds (required)
    pub service_date: Option<i64>,
    /// 1-based stop sequence disambiguating repeated stops
    pub stop_sequence: Option<u32>,
    pub vehicle_id: Option<String>,
    pub time: Option<i64>,
    pub key: Option<String>,
}

/// Mode A: a single trip's arrival and departure at a stop.
#[utoipa::path(
    get,
    path = "/api/where/arrival-and-departure-for-stop/{id}",
    responses(
        (status = 200, description = "The trip's arrival and departure at the stop"),
        (status = 400, description = "Missing or invalid parameters", body = super::error::ErrorBody),
        (status = 404, description = "No matching stop time", body = super::error::ErrorBody)
    ),
    tag = "where"
)]
pub async fn arrival_and_departure_for_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArrivalForStopQuery>,
) -> Result<Json<Envelope<EntryData<ArrivalAndDepartureDto>>>, ApiError> {
    let config = state.config.clone();
    with_deadline(&config, async move {
        check_key(&state.config, query.key.as_deref())?;

        let combined_trip = query
            .trip_id
            .as_deref()
            .ok_or_else(|| ApiError::validation("tripId", "missing required field"))?;
        let service_date = query
            .service_date
            .ok_or_else(|| ApiError::validation("serviceDate", "missing required field"))?;

        let store = store_for(&state).await?;
        let snapshot = state.provider.snapshot().await;

        let (agency_id, stop_id) = split_combined(&id)?;
        let (_, trip_id) = split_combined(combined_trip)?;
        let agency = store.agency(agency_id).ok_or(ApiError::NotFound)?;
        if !store.stops.contains_key(stop_id) {
            return Err(ApiError::NotFound);
        }
        if !store.trips.contains_key(trip_id) {
            return Err(ApiError::NotFound);
        }
        let tz = agency.tz();

        let day = ServiceDay::from_epoch_ms(tz, service_date)
            .ok_or_else(|| ApiError::validation("serviceDate", "must be epoch milliseconds"))?;

        let now = now_ms();
        let at = resolve_time(query.time, now)?;

        let vehicle_id = query
            .vehicle_id
            .as_deref()
            .map(split_combined)
            .transpose()?
            .map(|(_, native)| native);

        let mut assembler = Assembler::new(&store, &snapshot);
        let assembled = assembler
            .arrival_for_trip(trip_id, stop_id, query.stop_sequence, day, vehicle_id, at)
            .ok_or(ApiError::NotFound)?;

        let mut builder = ReferencesBuilder::new(&store, &snapshot);
        builder.add_agency(agency_id);
        builder.add_arrival(&assembled);

        Ok(Json(Envelope::ok(
            now,
            EntryData {
                entry: ArrivalAndDepartureDto::from_core(&store, &assembled),
                references: builder.build(),
            },
        )))
    })
    .await
}
