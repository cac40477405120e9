//! Full-day stop schedule, grouped per route and direction.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::schedule;
use crate::core::service_day::ServiceDay;

use super::envelope::{
    combined_route_id, combined_stop_id, combined_trip_id, Envelope, EntryData, ReferencesBuilder,
};
use super::{check_key, now_ms, split_combined, store_for, with_deadline};
use super::{ApiError, AppState};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleForStopQuery {
    /// Civil date `YYYY-MM-DD` in the agency zone (default: today)
    pub date: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStopTimeDto {
    pub arrival_enabled: bool,
    pub arrival_time: i64,
    pub departure_enabled: bool,
    pub departure_time: i64,
    pub service_id: String,
    pub trip_id: String,
    pub stop_headsign: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopRouteDirectionScheduleDto {
    pub trip_headsign: String,
    pub schedule_stop_times: Vec<ScheduleStopTimeDto>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopRouteScheduleDto {
    pub route_id: String,
    pub stop_route_direction_schedules: Vec<StopRouteDirectionScheduleDto>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopScheduleDto {
    pub date: i64,
    pub stop_id: String,
    pub stop_route_schedules: Vec<StopRouteScheduleDto>,
}

#[utoipa::path(
    get,
    path = "/api/where/schedule-for-stop/{id}",
    responses(
        (status = 200, description = "Per-route direction schedules for the date"),
        (status = 400, description = "Malformed date", body = super::error::ErrorBody),
        (status = 404, description = "Stop not found", body = super::error::ErrorBody)
    ),
    tag = "where"
)]
pub async fn schedule_for_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ScheduleForStopQuery>,
) -> Result<Json<Envelope<EntryData<StopScheduleDto>>>, ApiError> {
    let config = state.config.clone();
    with_deadline(&config, async move {
        check_key(&state.config, query.key.as_deref())?;

        let store = store_for(&state).await?;
        let snapshot = state.provider.snapshot().await;

        let (agency_id, stop_id) = split_combined(&id)?;
        let agency = store.agency(agency_id).ok_or(ApiError::NotFound)?;
        if !store.stops.contains_key(stop_id) {
            return Err(ApiError::NotFound);
        }
        let tz = agency.tz();

        let date = match &query.date {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| ApiError::validation("date", "expected YYYY-MM-DD"))?,
            None => chrono::Utc::now().with_timezone(&tz).date_naive(),
        };
        let day = ServiceDay::from_date(tz, date);

        let rows = schedule::rows_for_stop_on_day(&store, stop_id, day);

        // route -> direction/headsign -> rows, deterministically ordered
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<&schedule::ScheduleRow>>> =
            BTreeMap::new();
        for row in &rows {
            let headsign = row.headsign.clone().unwrap_or_default();
            grouped
                .entry(row.route_id.clone())
                .or_default()
                .entry(headsign)
                .or_default()
                .push(row);
        }

        let mut builder = ReferencesBuilder::new(&store, &snapshot);
        builder.add_agency(agency_id);
        builder.add_stop(stop_id);

        let mut stop_route_schedules: Vec<StopRouteScheduleDto> = Vec::new();
        for (route_id, directions) in grouped {
            builder.add_route(&route_id);
            let mut direction_schedules = Vec::new();
            for (trip_headsign, rows) in directions {
                let mut schedule_stop_times = Vec::new();
                for row in rows {
                    builder.add_trip(&row.trip_id);
                    let st = store
                        .stop_times_for_trip(&row.trip_id)
                        .iter()
                        .find(|st| st.stop_sequence == row.stop_sequence);
                    schedule_stop_times.push(ScheduleStopTimeDto {
                        arrival_enabled: st.map(|st| st.drop_off_type != 1).unwrap_or(true),
                        arrival_time: row.scheduled_arrival_ms,
                        departure_enabled: st.map(|st| st.pickup_type != 1).unwrap_or(true),
                        departure_time: row.scheduled_departure_ms,
                        service_id: row.service_id.clone(),
                        trip_id: combined_trip_id(&store, &row.trip_id),
                        stop_headsign: st
                            .and_then(|st| st.stop_headsign.clone())
                            .unwrap_or_default(),
                    });
                }
                direction_schedules.push(StopRouteDirectionScheduleDto {
                    trip_headsign,
                    schedule_stop_times,
                });
            }
            stop_route_schedules.push(StopRouteScheduleDto {
                route_id: combined_route_id(&store, &route_id),
                stop_route_direction_schedules: direction_schedules,
            });
        }

        let entry = StopScheduleDto {
            date: day.epoch_ms(),
            stop_id: combined_stop_id(&store, stop_id),
            stop_route_schedules,
        };

        Ok(Json(Envelope::ok(
            now_ms(),
            EntryData {
                entry,
                references: builder.build(),
            },
        )))
    })
    .await
}
