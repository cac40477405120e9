//! The `/api/where` REST surface.

pub mod arrivals;
pub mod block;
pub mod envelope;
pub mod error;
pub mod schedule_for_stop;
pub mod trip_details;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::config::Config;
use crate::providers::gtfs::GtfsProvider;
use crate::providers::gtfs::static_data::StaticStore;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<GtfsProvider>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/arrival-and-departure-for-stop/{id}",
            get(arrivals::arrival_and_departure_for_stop),
        )
        .route(
            "/arrivals-and-departures-for-stop/{id}",
            get(arrivals::arrivals_and_departures_for_stop),
        )
        .route("/trip-details/{id}", get(trip_details::trip_details))
        .route(
            "/schedule-for-stop/{id}",
            get(schedule_for_stop::schedule_for_stop),
        )
        .route("/block/{id}", get(block::block_details))
        .with_state(state)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reject unknown API keys up front; an empty configured list disables the
/// check.
pub(crate) fn check_key(config: &Config, key: Option<&str>) -> Result<(), ApiError> {
    if config.key_allowed(key) {
        Ok(())
    } else {
        Err(ApiError::PermissionDenied)
    }
}

/// Split a combined `{agency}_{native}` ID. Malformed IDs keep their
/// historical 500 response, uniformly across endpoints.
pub(crate) fn split_combined(combined: &str) -> Result<(&str, &str), ApiError> {
    crate::ids::extract(combined).ok_or(ApiError::Internal)
}

/// The static store, or 503 while no feed has been loaded yet.
pub(crate) async fn store_for(state: &AppState) -> Result<Arc<StaticStore>, ApiError> {
    state.provider.store().await.ok_or(ApiError::ServiceUnavailable)
}

/// Resolve the optional `time` parameter. Absent means now; more than a day
/// ahead of the wall clock is a validation failure.
pub(crate) fn resolve_time(time: Option<i64>, now_ms: i64) -> Result<i64, ApiError> {
    match time {
        None => Ok(now_ms),
        Some(t) => {
            if t > now_ms + 24 * 3600 * 1000 {
                return Err(ApiError::validation("time", "must not be in the future"));
            }
            if t <= 0 {
                return Err(ApiError::validation("time", "must be epoch milliseconds"));
            }
            Ok(t)
        }
    }
}

/// Run a handler body under the per-request wall-clock budget; expiry maps
/// to 503 and emits no partial body.
pub(crate) async fn with_deadline<T, F>(config: &Config, fut: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, ApiError>>,
{
    let budget = std::time::Duration::from_secs(config.api.request_deadline_secs.max(1));
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::ServiceUnavailable),
    }
}
