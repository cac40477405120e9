//! Trip details: the static schedule of one trip plus its live status.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::blocks::{self, BlockLayout};
use crate::core::service_day::ServiceDay;
use crate::core::trip_status;

use super::envelope::{
    combined_stop_id, Envelope, EntryData, ReferencesBuilder, TripStatusDto,
};
use super::{check_key, now_ms, resolve_time, split_combined, store_for, with_deadline};
use super::{ApiError, AppState};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TripDetailsQuery {
    /// Service date, epoch milliseconds (default: today, agency-local)
    pub service_date: Option<i64>,
    pub time: Option<i64>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TripStopTimeDto {
    /// Seconds since the service date's local midnight
    pub arrival_time: i64,
    pub departure_time: i64,
    pub stop_id: String,
    pub stop_headsign: String,
    pub pickup_type: i32,
    pub drop_off_type: i32,
    pub distance_along_trip: f64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TripScheduleDto {
    pub time_zone: String,
    pub stop_times: Vec<TripStopTimeDto>,
    pub previous_trip_id: String,
    pub next_trip_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TripDetailsDto {
    pub trip_id: String,
    pub service_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TripStatusDto>,
    pub schedule: TripScheduleDto,
    pub situation_ids: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/where/trip-details/{id}",
    responses(
        (status = 200, description = "Schedule and live status for the trip"),
        (status = 404, description = "Trip not found", body = super::error::ErrorBody)
    ),
    tag = "where"
)]
pub async fn trip_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TripDetailsQuery>,
) -> Result<Json<Envelope<EntryData<TripDetailsDto>>>, ApiError> {
    let config = state.config.clone();
    with_deadline(&config, async move {
        check_key(&state.config, query.key.as_deref())?;

        let store = store_for(&state).await?;
        let snapshot = state.provider.snapshot().await;

        let (agency_id, trip_id) = split_combined(&id)?;
        let agency = store.agency(agency_id).ok_or(ApiError::NotFound)?;
        if !store.trips.contains_key(trip_id) {
            return Err(ApiError::NotFound);
        }
        let tz = agency.tz();

        let now = now_ms();
        let at = resolve_time(query.time, now)?;
        let day = match query.service_date {
            Some(ms) => ServiceDay::from_epoch_ms(tz, ms)
                .ok_or_else(|| ApiError::validation("serviceDate", "must be epoch milliseconds"))?,
            None => ServiceDay::containing(tz, chrono::Utc::now()),
        };

        let status = trip_status::build(&store, &snapshot, trip_id, day, at);

        let distances = blocks::stop_distances_along_trip(&store, trip_id);
        let stop_times: Vec<TripStopTimeDto> = store
            .stop_times_for_trip(trip_id)
            .iter()
            .enumerate()
            .filter_map(|(i, st)| {
                let arrival = st.arrival_or_departure()?;
                let departure = st.departure_or_arrival()?;
                Some(TripStopTimeDto {
                    arrival_time: i64::from(arrival),
                    departure_time: i64::from(departure),
                    stop_id: combined_stop_id(&store, &st.stop_id),
                    stop_headsign: st.stop_headsign.clone().unwrap_or_default(),
                    pickup_type: st.pickup_type,
                    drop_off_type: st.drop_off_type,
                    distance_along_trip: distances.get(i).copied().unwrap_or(0.0),
                })
            })
            .collect();

        let layout = BlockLayout::for_trip(&store, trip_id, day);
        let previous_trip_id = layout
            .previous_trip(trip_id)
            .map(|e| super::envelope::combined_trip_id(&store, &e.trip_id))
            .unwrap_or_default();
        let next_trip_id = layout
            .next_trip(trip_id)
            .map(|e| super::envelope::combined_trip_id(&store, &e.trip_id))
            .unwrap_or_default();

        let mut builder = ReferencesBuilder::new(&store, &snapshot);
        builder.add_agency(agency_id);
        builder.add_trip(trip_id);
        for st in store.stop_times_for_trip(trip_id) {
            builder.add_stop(&st.stop_id);
        }
        if let Some(prev) = layout.previous_trip(trip_id) {
            builder.add_trip(&prev.trip_id);
        }
        if let Some(next) = layout.next_trip(trip_id) {
            builder.add_trip(&next.trip_id);
        }

        let situation_ids: Vec<String> = status
            .as_ref()
            .map(|s| s.situation_ids.clone())
            .unwrap_or_default();
        for situation_id in &situation_ids {
            builder.add_situation(situation_id);
        }
        if let Some(status) = &status {
            builder.add_trip_status(status);
        }

        let entry = TripDetailsDto {
            trip_id: super::envelope::combined_trip_id(&store, trip_id),
            service_date: day.epoch_ms(),
            status: status.as_ref().map(|s| TripStatusDto::from_info(&store, s)),
            schedule: TripScheduleDto {
                time_zone: agency.timezone.clone(),
                stop_times,
                previous_trip_id,
                next_trip_id,
            },
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
