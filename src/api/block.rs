//! Block configuration: the trip chain one vehicle serves across a day.

use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::blocks::{self, BlockLayout};
use crate::core::service_day::ServiceDay;
use crate::ids;

use super::envelope::{combined_stop_id, combined_trip_id, Envelope, EntryData, ReferencesBuilder};
use super::{check_key, now_ms, split_combined, store_for, with_deadline};
use super::{ApiError, AppState};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockQuery {
    /// Service date, epoch milliseconds (default: today, agency-local)
    pub service_date: Option<i64>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockScheduledStopTimeDto {
    pub stop_id: String,
    /// Seconds since the service date's local midnight
    pub arrival_time: i64,
    pub departure_time: i64,
    pub pickup_type: i32,
    pub drop_off_type: i32,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockStopTimeDto {
    /// Position of this stop within the whole block's stop chain
    pub block_sequence: u32,
    pub distance_along_block: f64,
    pub stop_time: BlockScheduledStopTimeDto,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockTripDto {
    pub trip_id: String,
    pub block_trip_sequence: u32,
    pub distance_along_block: f64,
    pub block_stop_times: Vec<BlockStopTimeDto>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockConfigurationDto {
    pub active_service_ids: Vec<String>,
    pub trips: Vec<BlockTripDto>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDto {
    pub id: String,
    pub service_date: i64,
    pub configurations: Vec<BlockConfigurationDto>,
}

#[utoipa::path(
    get,
    path = "/api/where/block/{id}",
    responses(
        (status = 200, description = "Block configuration with cumulative distances"),
        (status = 404, description = "Block not found", body = super::error::ErrorBody)
    ),
    tag = "where"
)]
pub async fn block_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BlockQuery>,
) -> Result<Json<Envelope<EntryData<BlockDto>>>, ApiError> {
    let config = state.config.clone();
    with_deadline(&config, async move {
        check_key(&state.config, query.key.as_deref())?;

        let store = store_for(&state).await?;
        let snapshot = state.provider.snapshot().await;

        let (agency_id, block_id) = split_combined(&id)?;
        let agency = store.agency(agency_id).ok_or(ApiError::NotFound)?;
        if store.trips_in_block(block_id).is_empty() {
            return Err(ApiError::NotFound);
        }
        let tz = agency.tz();

        let day = match query.service_date {
            Some(ms) => ServiceDay::from_epoch_ms(tz, ms)
                .ok_or_else(|| ApiError::validation("serviceDate", "must be epoch milliseconds"))?,
            None => ServiceDay::containing(tz, chrono::Utc::now()),
        };

        let layout = BlockLayout::for_block(&store, block_id, day);

        let mut builder = ReferencesBuilder::new(&store, &snapshot);
        builder.add_agency(agency_id);

        let mut active_service_ids: BTreeSet<String> = BTreeSet::new();
        let mut trips = Vec::with_capacity(layout.trips.len());
        for entry in &layout.trips {
            builder.add_trip(&entry.trip_id);
            if let Some(trip) = store.trips.get(&entry.trip_id) {
                active_service_ids.insert(trip.service_id.clone());
            }

            let distances = blocks::stop_distances_along_trip(&store, &entry.trip_id);
            let mut block_stop_times = Vec::new();
            for (i, st) in store.stop_times_for_trip(&entry.trip_id).iter().enumerate() {
                let (Some(arrival), Some(departure)) =
                    (st.arrival_or_departure(), st.departure_or_arrival())
                else {
                    continue;
                };
                builder.add_stop(&st.stop_id);
                block_stop_times.push(BlockStopTimeDto {
                    block_sequence: entry.stop_offset + i as u32,
                    distance_along_block: entry.distance_offset_m
                        + distances.get(i).copied().unwrap_or(0.0),
                    stop_time: BlockScheduledStopTimeDto {
                        stop_id: combined_stop_id(&store, &st.stop_id),
                        arrival_time: i64::from(arrival),
                        departure_time: i64::from(departure),
                        pickup_type: st.pickup_type,
                        drop_off_type: st.drop_off_type,
                    },
                });
            }

            trips.push(BlockTripDto {
                trip_id: combined_trip_id(&store, &entry.trip_id),
                block_trip_sequence: entry.sequence,
                distance_along_block: entry.distance_offset_m,
                block_stop_times,
            });
        }

        let entry = BlockDto {
            id: ids::form(agency_id, block_id),
            service_date: day.epoch_ms(),
            configurations: vec![BlockConfigurationDto {
                active_service_ids: active_service_ids.into_iter().collect(),
                trips,
            }],
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
