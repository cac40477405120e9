//! GTFS data plane.
//!
//! Loads the static feed (zip/CSV) into an in-memory [`StaticStore`] and
//! polls a GTFS-RT protobuf feed into a [`RealtimeSnapshot`]. Both are
//! published behind `Arc` swaps: writers build a complete replacement and
//! install it; readers clone the `Arc` once per request and never block a
//! refresh.

pub mod error;
pub mod realtime;
pub mod static_data;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::GtfsConfig;
use error::GtfsError;
use realtime::RealtimeSnapshot;
use static_data::StaticStore;

pub struct GtfsProvider {
    client: reqwest::Client,
    config: GtfsConfig,
    store: RwLock<Option<Arc<StaticStore>>>,
    snapshot: RwLock<Arc<RealtimeSnapshot>>,
}

impl GtfsProvider {
    pub fn new(config: GtfsConfig) -> Result<Self, GtfsError> {
        let client = reqwest::Client::builder()
            .user_agent("wherebus/0.1 (+https://github.com/wherebus/wherebus)")
            .build()?;

        Ok(Self {
            client,
            config,
            store: RwLock::new(None),
            snapshot: RwLock::new(Arc::new(RealtimeSnapshot::empty())),
        })
    }

    /// Resolve, download if needed, and load the static feed, then swap the
    /// new store in.
    pub async fn refresh_static_feed(&self) -> Result<(), GtfsError> {
        let zip_path = match (&self.config.static_feed_path, &self.config.static_feed_url) {
            (Some(path), _) => PathBuf::from(path),
            (None, Some(url)) => {
                static_data::download_feed(&self.client, url, &self.config.cache_dir).await?
            }
            (None, None) => return Err(GtfsError::NotConfigured),
        };

        let store = tokio::task::spawn_blocking(move || static_data::load_store(&zip_path))
            .await??;

        info!(
            agencies = store.agencies.len(),
            stops = store.stops.len(),
            routes = store.routes.len(),
            trips = store.trips.len(),
            "Loaded static GTFS feed into memory"
        );

        let mut guard = self.store.write().await;
        *guard = Some(Arc::new(store));
        Ok(())
    }

    /// The current static store; `None` until the first successful load.
    pub async fn store(&self) -> Option<Arc<StaticStore>> {
        self.store.read().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn install_store(&self, store: StaticStore) {
        let mut guard = self.store.write().await;
        *guard = Some(Arc::new(store));
    }

    #[cfg(test)]
    pub(crate) async fn install_snapshot(&self, snapshot: RealtimeSnapshot) {
        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(snapshot);
    }

    /// The current realtime snapshot (possibly empty, never absent).
    pub async fn snapshot(&self) -> Arc<RealtimeSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Fetch the GTFS-RT feed once and swap in a fresh snapshot.
    pub async fn poll_realtime_once(&self) -> Result<(), GtfsError> {
        let Some(url) = &self.config.realtime_feed_url else {
            return Ok(());
        };

        let feed = realtime::fetch_feed(&self.client, url).await?;
        let snapshot = RealtimeSnapshot::from_feed(&feed);

        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(snapshot);
        Ok(())
    }

    /// Poll the GTFS-RT feed forever at the configured interval. A failed
    /// poll keeps the previous snapshot alive.
    pub async fn run_realtime_poller(self: Arc<Self>) {
        if self.config.realtime_feed_url.is_none() {
            warn!("No GTFS-RT feed configured; serving schedule-only responses");
            return;
        }

        let interval_secs = self.config.poll_interval_secs.max(1);
        info!(interval_secs, "Starting GTFS-RT poll loop");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        loop {
            interval.tick().await;
            match self.poll_realtime_once().await {
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "GTFS-RT poll failed, keeping previous snapshot");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GtfsProvider {
        GtfsProvider::new(GtfsConfig {
            static_feed_path: Some("./feed.zip".to_string()),
            static_feed_url: None,
            cache_dir: "./gtfs-cache".to_string(),
            realtime_feed_url: None,
            poll_interval_secs: 30,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_absent_before_load() {
        let provider = provider();
        assert!(provider.store().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_starts_empty() {
        let provider = provider();
        let snapshot = provider.snapshot().await;
        assert!(snapshot.vehicle_for_trip("any").is_none());
    }

    #[tokio::test]
    async fn test_poll_without_url_is_noop() {
        let provider = provider();
        provider.poll_realtime_once().await.unwrap();
        assert_eq!(provider.snapshot().await.timestamp_ms, 0);
    }
}
