use thiserror::Error;

/// Failures in the GTFS data plane.
///
/// Upstream trouble (the feed host) is kept apart from local trouble (a feed
/// we fetched but cannot use) so the poller and the loader can log them at
/// different severities. None of these messages cross the API boundary.
#[derive(Debug, Error)]
pub enum GtfsError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("upstream rejected the request: {0}")]
    UpstreamStatus(String),
    #[error("unusable feed: {0}")]
    BadFeed(String),
    #[error("could not open feed archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("could not read feed table: {0}")]
    Table(#[from] csv::Error),
    #[error("could not decode realtime payload: {0}")]
    Realtime(#[from] prost::DecodeError),
    #[error("feed cache I/O failed: {0}")]
    Cache(#[from] std::io::Error),
    #[error("feed loader task died: {0}")]
    Loader(#[from] tokio::task::JoinError),
    #[error("no static feed configured")]
    NotConfigured,
}
