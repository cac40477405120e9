mod api;
mod config;
mod core;
mod geo;
mod ids;
mod providers;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api::AppState;
use config::Config;
use providers::gtfs::GtfsProvider;

#[derive(OpenApi)]
#[openapi(
    info(title = "Wherebus API", version = "0.1.0"),
    paths(
        api::arrivals::arrivals_and_departures_for_stop,
        api::arrivals::arrival_and_departure_for_stop,
        api::trip_details::trip_details,
        api::schedule_for_stop::schedule_for_stop,
        api::block::block_details,
    ),
    components(schemas(
        api::envelope::AgencyRef,
        api::envelope::RouteRef,
        api::envelope::StopRef,
        api::envelope::TripRef,
        api::envelope::SituationRef,
        api::envelope::References,
        api::envelope::TripStatusDto,
        api::envelope::ArrivalAndDepartureDto,
        api::arrivals::StopWithArrivalsAndDeparturesDto,
        api::trip_details::TripDetailsDto,
        api::trip_details::TripScheduleDto,
        api::trip_details::TripStopTimeDto,
        api::schedule_for_stop::StopScheduleDto,
        api::schedule_for_stop::StopRouteScheduleDto,
        api::schedule_for_stop::StopRouteDirectionScheduleDto,
        api::schedule_for_stop::ScheduleStopTimeDto,
        api::block::BlockDto,
        api::block::BlockConfigurationDto,
        api::block::BlockTripDto,
        api::block::BlockStopTimeDto,
        api::block::BlockScheduledStopTimeDto,
        api::error::ErrorBody,
    )),
    tags(
        (name = "where", description = "OBA-compatible arrivals, trips, schedules, and blocks")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path).expect("Failed to load config");
    tracing::info!(path = %config_path, "Loaded configuration");

    // Explicit origins win over the permissive escape hatch
    let cors_layer = if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "Limiting CORS to the configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else if config.cors_permissive {
        tracing::warn!("Serving with wide-open CORS; list cors_origins before exposing this publicly");
        CorsLayer::permissive()
    } else {
        panic!("refusing to start without a CORS policy: list cors_origins, or opt into cors_permissive for local development");
    };

    let provider = Arc::new(GtfsProvider::new(config.gtfs.clone()).expect("Failed to initialize GTFS provider"));

    // The static feed is a prerequisite: no serving before it is in memory
    provider
        .refresh_static_feed()
        .await
        .expect("Failed to load static GTFS feed");

    // First RT poll is best-effort; the poller keeps trying on its interval
    if let Err(e) = provider.poll_realtime_once().await {
        tracing::warn!(error = %e, "Initial GTFS-RT poll failed, starting with an empty snapshot");
    }
    let poller = provider.clone();
    tokio::spawn(async move {
        poller.run_realtime_poller().await;
    });

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
        provider,
    };

    let app = Router::new()
        .route("/", get(root))
        .nest("/api/where", api::router(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", bind_addr, e));

    tracing::info!("Server running on http://{}", bind_addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "Wherebus API"
}
