use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, Weekday};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::error::GtfsError;

/// Maximum allowed download size for the static GTFS zip (500 MB)
const MAX_DOWNLOAD_SIZE: u64 = 500 * 1024 * 1024;
/// Maximum length for cached HTTP header values (ETag, Last-Modified)
const MAX_HEADER_LENGTH: usize = 1024;

// --- Public types for the in-memory store ---

/// A GTFS agency (from agency.txt). Owns time-zone resolution for all of its
/// stops and trips.
#[derive(Debug, Clone)]
pub struct Agency {
    pub agency_id: String,
    pub name: String,
    pub url: Option<String>,
    /// IANA zone name, e.g. "America/Los_Angeles". Invalid values fall back
    /// to UTC at resolution time.
    pub timezone: String,
    pub lang: Option<String>,
}

impl Agency {
    /// Parse the agency time zone, falling back to UTC when the IANA name
    /// is unknown. The fallback is logged once per call site that hits it.
    pub fn tz(&self) -> chrono_tz::Tz {
        match self.timezone.parse::<chrono_tz::Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(agency = %self.agency_id, timezone = %self.timezone, "Unknown agency timezone, falling back to UTC");
                chrono_tz::Tz::UTC
            }
        }
    }
}

/// Wheelchair accessibility of a stop (stops.txt `wheelchair_boarding`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelchairBoarding {
    Unknown,
    Accessible,
    NotAccessible,
}

impl WheelchairBoarding {
    pub fn from_gtfs(value: Option<i32>) -> Self {
        match value {
            Some(1) => Self::Accessible,
            Some(2) => Self::NotAccessible,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Accessible => "ACCESSIBLE",
            Self::NotAccessible => "NOT_ACCESSIBLE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stop {
    pub stop_id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub location_type: i32,
    pub wheelchair_boarding: WheelchairBoarding,
    pub parent_station: Option<String>,
    /// Compass label (N, NE, ..., NW) from the stop_direction extension
    /// column; absent means unknown.
    pub direction: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: String,
    pub agency_id: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub description: Option<String>,
    pub route_type: i32,
    pub color: Option<String>,
    pub text_color: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub headsign: Option<String>,
    pub direction_id: Option<i32>,
    pub block_id: Option<String>,
    pub shape_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StopTime {
    /// 1-based in the feed; exposed sequences are converted to 0-based at
    /// the wire boundary only.
    pub stop_sequence: u32,
    pub stop_id: String,
    /// Seconds since local midnight of the service day (can exceed 86400)
    pub arrival_secs: Option<i32>,
    /// Seconds since local midnight
    pub departure_secs: Option<i32>,
    pub stop_headsign: Option<String>,
    pub pickup_type: i32,
    pub drop_off_type: i32,
    pub shape_dist_traveled: Option<f64>,
}

impl StopTime {
    /// Arrival with departure as fallback; rows with neither are skipped by
    /// the materializer.
    pub fn arrival_or_departure(&self) -> Option<i32> {
        self.arrival_secs.or(self.departure_secs)
    }

    pub fn departure_or_arrival(&self) -> Option<i32> {
        self.departure_secs.or(self.arrival_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ShapePoint {
    pub sequence: u32,
    pub lat: f64,
    pub lon: f64,
    pub dist_traveled: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Calendar {
    pub service_id: String,
    pub days: [bool; 7], // mon..sun
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct CalendarDate {
    pub date: NaiveDate,
    /// 1 = service added, 2 = service removed
    pub exception_type: i32,
}

/// The full in-memory static store. Built once per feed load and handed to
/// request handlers behind an `Arc`; a refresh builds a new store and swaps
/// the `Arc` so readers never see a partial feed.
pub struct StaticStore {
    pub agencies: HashMap<String, Agency>,
    /// Agency IDs in feed order; the first one is the default for entities
    /// with no explicit agency.
    pub agency_order: Vec<String>,
    pub stops: HashMap<String, Stop>,
    pub routes: HashMap<String, Route>,
    pub trips: HashMap<String, Trip>,
    /// trip_id -> stop_times ordered by stop_sequence
    pub stop_times: HashMap<String, Vec<StopTime>>,
    /// shape_id -> points ordered by sequence
    pub shapes: HashMap<String, Vec<ShapePoint>>,
    pub calendars: HashMap<String, Calendar>,
    /// service_id -> exceptions
    pub calendar_dates: HashMap<String, Vec<CalendarDate>>,
    /// stop_id -> trip_ids visiting that stop
    pub trips_by_stop: HashMap<String, HashSet<String>>,
    /// block_id -> trip_ids sharing the block
    pub trips_by_block: HashMap<String, Vec<String>>,
}

impl StaticStore {
    /// Check if a service is active on the given date. Exceptions override
    /// the weekly calendar.
    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        if let Some(exceptions) = self.calendar_dates.get(service_id) {
            for exc in exceptions {
                if exc.date == date {
                    return exc.exception_type == 1;
                }
            }
        }

        if let Some(cal) = self.calendars.get(service_id) {
            if date < cal.start_date || date > cal.end_date {
                return false;
            }
            let day_index = match date.weekday() {
                Weekday::Mon => 0,
                Weekday::Tue => 1,
                Weekday::Wed => 2,
                Weekday::Thu => 3,
                Weekday::Fri => 4,
                Weekday::Sat => 5,
                Weekday::Sun => 6,
            };
            return cal.days[day_index];
        }

        false
    }

    /// All service IDs active on a date, combining the weekly calendar with
    /// added/removed exceptions. Total over every service the feed names.
    pub fn active_service_ids(&self, date: NaiveDate) -> HashSet<String> {
        let mut ids: HashSet<String> = HashSet::new();
        for service_id in self.calendars.keys().chain(self.calendar_dates.keys()) {
            if self.is_service_active(service_id, date) {
                ids.insert(service_id.clone());
            }
        }
        ids
    }

    pub fn agency(&self, agency_id: &str) -> Option<&Agency> {
        self.agencies.get(agency_id)
    }

    pub fn default_agency(&self) -> Option<&Agency> {
        self.agency_order.first().and_then(|id| self.agencies.get(id))
    }

    /// The agency owning a route, falling back to the feed's first agency
    /// for single-agency feeds that omit routes.agency_id.
    pub fn agency_for_route(&self, route_id: &str) -> Option<&Agency> {
        let route = self.routes.get(route_id)?;
        match &route.agency_id {
            Some(id) => self.agencies.get(id).or_else(|| self.default_agency()),
            None => self.default_agency(),
        }
    }

    pub fn agency_for_trip(&self, trip_id: &str) -> Option<&Agency> {
        let trip = self.trips.get(trip_id)?;
        self.agency_for_route(&trip.route_id)
    }

    /// Ordered stop_times for a trip; empty slice for unknown trips.
    pub fn stop_times_for_trip(&self, trip_id: &str) -> &[StopTime] {
        self.stop_times.get(trip_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Shape points as (lat, lon) pairs for the geo primitives.
    pub fn shape_polyline(&self, shape_id: &str) -> Vec<(f64, f64)> {
        self.shapes
            .get(shape_id)
            .map(|points| points.iter().map(|p| (p.lat, p.lon)).collect())
            .unwrap_or_default()
    }

    /// Polyline for a trip's shape, or an empty vec when the trip has no
    /// usable shape (callers fall back to stop-to-stop distances).
    pub fn trip_polyline(&self, trip_id: &str) -> Vec<(f64, f64)> {
        self.trips
            .get(trip_id)
            .and_then(|t| t.shape_id.as_deref())
            .map(|shape_id| self.shape_polyline(shape_id))
            .unwrap_or_default()
    }

    pub fn trips_at_stop(&self, stop_id: &str) -> impl Iterator<Item = &String> {
        self.trips_by_stop.get(stop_id).into_iter().flatten()
    }

    pub fn trips_in_block(&self, block_id: &str) -> &[String] {
        self.trips_by_block
            .get(block_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// --- Download and loading ---

/// Download the static GTFS feed to the cache directory, reusing the cached
/// zip when the server reports it unchanged.
pub async fn download_feed(
    client: &reqwest::Client,
    url: &str,
    cache_dir: &str,
) -> Result<PathBuf, GtfsError> {
    let cache_path = Path::new(cache_dir);
    tokio::fs::create_dir_all(cache_path).await?;

    let zip_path = cache_path.join("latest.zip");
    let metadata_path = cache_path.join("metadata.json");

    let mut request = client.get(url);
    if let Ok(meta_content) = tokio::fs::read_to_string(&metadata_path).await {
        if let Ok(meta) = serde_json::from_str::<serde_json::Value>(&meta_content) {
            if let Some(etag) = meta.get("etag").and_then(|v| v.as_str()) {
                request = request.header("If-None-Match", etag);
            }
            if let Some(last_modified) = meta.get("last_modified").and_then(|v| v.as_str()) {
                request = request.header("If-Modified-Since", last_modified);
            }
        }
    }

    let response = request
        .timeout(std::time::Duration::from_secs(600))
        .send()
        .await?;

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        info!("Upstream reports the static feed unchanged, reusing cached zip");
        return Ok(zip_path);
    }

    if !response.status().is_success() {
        return Err(GtfsError::UpstreamStatus(format!(
            "static feed responded HTTP {}",
            response.status()
        )));
    }

    if let Some(content_length) = response.content_length() {
        if content_length > MAX_DOWNLOAD_SIZE {
            return Err(GtfsError::UpstreamStatus(format!(
                "static feed is {} bytes, over the {} byte cap",
                content_length, MAX_DOWNLOAD_SIZE
            )));
        }
    }

    let etag = response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .filter(|s| s.len() <= MAX_HEADER_LENGTH)
        .map(|s| s.to_string());
    let last_modified = response
        .headers()
        .get("last-modified")
        .and_then(|v| v.to_str().ok())
        .filter(|s| s.len() <= MAX_HEADER_LENGTH)
        .map(|s| s.to_string());

    let mut total_bytes: u64 = 0;
    let mut file = tokio::fs::File::create(&zip_path).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total_bytes += chunk.len() as u64;
        if total_bytes > MAX_DOWNLOAD_SIZE {
            drop(file);
            let _ = tokio::fs::remove_file(&zip_path).await;
            return Err(GtfsError::UpstreamStatus(format!(
                "static feed stream passed the {} byte cap",
                MAX_DOWNLOAD_SIZE
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    info!(size_mb = total_bytes / (1024 * 1024), "Fetched static GTFS feed");

    let meta = serde_json::json!({
        "etag": etag,
        "last_modified": last_modified,
        "downloaded_at": chrono::Utc::now().to_rfc3339(),
    });
    let _ = tokio::fs::write(&metadata_path, meta.to_string()).await;

    Ok(zip_path)
}

/// Load the GTFS zip into an in-memory store (blocking, call on
/// spawn_blocking).
pub fn load_store(zip_path: &Path) -> Result<StaticStore, GtfsError> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let (agencies, agency_order) = parse_agencies(&mut archive)?;
    info!(count = agencies.len(), "Parsed GTFS agencies");

    let stops = parse_stops(&mut archive)?;
    info!(count = stops.len(), "Parsed GTFS stops");

    let routes = parse_routes(&mut archive)?;
    info!(count = routes.len(), "Parsed GTFS routes");

    let trips = parse_trips(&mut archive)?;
    info!(count = trips.len(), "Parsed GTFS trips");

    let stop_times = parse_stop_times(&mut archive)?;
    let total_st: usize = stop_times.values().map(|v| v.len()).sum();
    info!(trips_with_times = stop_times.len(), total_stop_times = total_st, "Parsed GTFS stop_times");

    let shapes = parse_shapes(&mut archive);
    info!(count = shapes.len(), "Parsed GTFS shapes");

    let calendars = parse_calendar(&mut archive);
    info!(count = calendars.len(), "Parsed GTFS calendar");

    let calendar_dates = parse_calendar_dates(&mut archive);
    info!(services = calendar_dates.len(), "Parsed GTFS calendar_dates");

    let mut trips_by_stop: HashMap<String, HashSet<String>> = HashMap::new();
    for (trip_id, sts) in &stop_times {
        for st in sts {
            trips_by_stop
                .entry(st.stop_id.clone())
                .or_default()
                .insert(trip_id.clone());
        }
    }

    let mut trips_by_block: HashMap<String, Vec<String>> = HashMap::new();
    for trip in trips.values() {
        if let Some(block_id) = &trip.block_id {
            trips_by_block
                .entry(block_id.clone())
                .or_default()
                .push(trip.trip_id.clone());
        }
    }
    // Stable membership order regardless of HashMap iteration
    for members in trips_by_block.values_mut() {
        members.sort();
    }
    info!(
        stops_indexed = trips_by_stop.len(),
        blocks = trips_by_block.len(),
        "Built stop and block indexes"
    );

    Ok(StaticStore {
        agencies,
        agency_order,
        stops,
        routes,
        trips,
        stop_times,
        shapes,
        calendars,
        calendar_dates,
        trips_by_stop,
        trips_by_block,
    })
}

// --- Helper functions ---

/// Parse GTFS time string "HH:MM:SS" to seconds since midnight.
/// Supports hours >= 24 for trips crossing midnight.
pub fn parse_gtfs_time(time_str: &str) -> Option<i32> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: i32 = parts[0].trim().parse().ok()?;
    let minutes: i32 = parts[1].parse().ok()?;
    let seconds: i32 = parts[2].parse().ok()?;
    if hours < 0 || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Parse GTFS date string "YYYYMMDD" to NaiveDate.
pub fn parse_gtfs_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

// --- CSV parsing ---

type Archive = zip::ZipArchive<std::fs::File>;

fn parse_agencies(archive: &mut Archive) -> Result<(HashMap<String, Agency>, Vec<String>), GtfsError> {
    let file = archive.by_name("agency.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_id = headers.iter().position(|h| h == "agency_id");
    let idx_name = headers
        .iter()
        .position(|h| h == "agency_name")
        .ok_or_else(|| GtfsError::BadFeed("agency.txt missing agency_name".into()))?;
    let idx_url = headers.iter().position(|h| h == "agency_url");
    let idx_tz = headers
        .iter()
        .position(|h| h == "agency_timezone")
        .ok_or_else(|| GtfsError::BadFeed("agency.txt missing agency_timezone".into()))?;
    let idx_lang = headers.iter().position(|h| h == "agency_lang");

    let mut agencies = HashMap::new();
    let mut order = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let name = record.get(idx_name).unwrap_or("").to_string();
        // agency_id is optional for single-agency feeds; fall back to the name
        let agency_id = idx_id
            .and_then(|i| record.get(i))
            .and_then(non_empty)
            .unwrap_or_else(|| name.clone());
        if agency_id.is_empty() {
            continue;
        }
        order.push(agency_id.clone());
        agencies.insert(
            agency_id.clone(),
            Agency {
                agency_id,
                name,
                url: idx_url.and_then(|i| record.get(i)).and_then(non_empty),
                timezone: record.get(idx_tz).unwrap_or("").to_string(),
                lang: idx_lang.and_then(|i| record.get(i)).and_then(non_empty),
            },
        );
    }
    if agencies.is_empty() {
        return Err(GtfsError::BadFeed("agency.txt has no agencies".into()));
    }
    Ok((agencies, order))
}

fn parse_stops(archive: &mut Archive) -> Result<HashMap<String, Stop>, GtfsError> {
    let file = archive.by_name("stops.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_id = headers
        .iter()
        .position(|h| h == "stop_id")
        .ok_or_else(|| GtfsError::BadFeed("stops.txt missing stop_id".into()))?;
    let idx_code = headers.iter().position(|h| h == "stop_code");
    let idx_name = headers.iter().position(|h| h == "stop_name");
    let idx_lat = headers.iter().position(|h| h == "stop_lat");
    let idx_lon = headers.iter().position(|h| h == "stop_lon");
    let idx_loc = headers.iter().position(|h| h == "location_type");
    let idx_wheel = headers.iter().position(|h| h == "wheelchair_boarding");
    let idx_parent = headers.iter().position(|h| h == "parent_station");
    let idx_dir = headers.iter().position(|h| h == "stop_direction");

    let mut stops = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let stop_id = record.get(idx_id).unwrap_or("").to_string();
        let lat = idx_lat.and_then(|i| record.get(i)).and_then(|s| s.parse().ok());
        let lon = idx_lon.and_then(|i| record.get(i)).and_then(|s| s.parse().ok());
        let (Some(lat), Some(lon)) = (lat, lon) else {
            skipped += 1;
            continue;
        };
        if stop_id.is_empty() {
            skipped += 1;
            continue;
        }
        stops.insert(
            stop_id.clone(),
            Stop {
                stop_id,
                code: idx_code.and_then(|i| record.get(i)).and_then(non_empty),
                name: idx_name.and_then(|i| record.get(i)).and_then(non_empty),
                lat,
                lon,
                location_type: idx_loc
                    .and_then(|i| record.get(i))
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                wheelchair_boarding: WheelchairBoarding::from_gtfs(
                    idx_wheel.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
                ),
                parent_station: idx_parent.and_then(|i| record.get(i)).and_then(non_empty),
                direction: idx_dir.and_then(|i| record.get(i)).and_then(non_empty),
            },
        );
    }
    if skipped > 0 {
        warn!(skipped, "Skipped stops.txt records with missing id or coordinates");
    }
    Ok(stops)
}

fn parse_routes(archive: &mut Archive) -> Result<HashMap<String, Route>, GtfsError> {
    let file = archive.by_name("routes.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_id = headers
        .iter()
        .position(|h| h == "route_id")
        .ok_or_else(|| GtfsError::BadFeed("routes.txt missing route_id".into()))?;
    let idx_agency = headers.iter().position(|h| h == "agency_id");
    let idx_short = headers.iter().position(|h| h == "route_short_name");
    let idx_long = headers.iter().position(|h| h == "route_long_name");
    let idx_desc = headers.iter().position(|h| h == "route_desc");
    let idx_type = headers.iter().position(|h| h == "route_type");
    let idx_color = headers.iter().position(|h| h == "route_color");
    let idx_text = headers.iter().position(|h| h == "route_text_color");

    let mut routes = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let route_id = record.get(idx_id).unwrap_or("").to_string();
        if route_id.is_empty() {
            skipped += 1;
            continue;
        }
        routes.insert(
            route_id.clone(),
            Route {
                route_id,
                agency_id: idx_agency.and_then(|i| record.get(i)).and_then(non_empty),
                short_name: idx_short.and_then(|i| record.get(i)).and_then(non_empty),
                long_name: idx_long.and_then(|i| record.get(i)).and_then(non_empty),
                description: idx_desc.and_then(|i| record.get(i)).and_then(non_empty),
                route_type: idx_type
                    .and_then(|i| record.get(i))
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
                color: idx_color.and_then(|i| record.get(i)).and_then(non_empty),
                text_color: idx_text.and_then(|i| record.get(i)).and_then(non_empty),
            },
        );
    }
    if skipped > 0 {
        warn!(skipped, "Skipped routes.txt records with empty route_id");
    }
    Ok(routes)
}

fn parse_trips(archive: &mut Archive) -> Result<HashMap<String, Trip>, GtfsError> {
    let file = archive.by_name("trips.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_trip = headers
        .iter()
        .position(|h| h == "trip_id")
        .ok_or_else(|| GtfsError::BadFeed("trips.txt missing trip_id".into()))?;
    let idx_route = headers
        .iter()
        .position(|h| h == "route_id")
        .ok_or_else(|| GtfsError::BadFeed("trips.txt missing route_id".into()))?;
    let idx_service = headers
        .iter()
        .position(|h| h == "service_id")
        .ok_or_else(|| GtfsError::BadFeed("trips.txt missing service_id".into()))?;
    let idx_headsign = headers.iter().position(|h| h == "trip_headsign");
    let idx_dir = headers.iter().position(|h| h == "direction_id");
    let idx_block = headers.iter().position(|h| h == "block_id");
    let idx_shape = headers.iter().position(|h| h == "shape_id");

    let mut trips = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let trip_id = record.get(idx_trip).unwrap_or("").to_string();
        if trip_id.is_empty() {
            skipped += 1;
            continue;
        }
        trips.insert(
            trip_id.clone(),
            Trip {
                trip_id,
                route_id: record.get(idx_route).unwrap_or("").to_string(),
                service_id: record.get(idx_service).unwrap_or("").to_string(),
                headsign: idx_headsign.and_then(|i| record.get(i)).and_then(non_empty),
                direction_id: idx_dir
                    .and_then(|i| record.get(i))
                    .and_then(|s| s.parse().ok()),
                block_id: idx_block.and_then(|i| record.get(i)).and_then(non_empty),
                shape_id: idx_shape.and_then(|i| record.get(i)).and_then(non_empty),
            },
        );
    }
    if skipped > 0 {
        warn!(skipped, "Skipped trips.txt records with empty trip_id");
    }
    Ok(trips)
}

fn parse_stop_times(archive: &mut Archive) -> Result<HashMap<String, Vec<StopTime>>, GtfsError> {
    let file = archive.by_name("stop_times.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_trip = headers
        .iter()
        .position(|h| h == "trip_id")
        .ok_or_else(|| GtfsError::BadFeed("stop_times.txt missing trip_id".into()))?;
    let idx_seq = headers
        .iter()
        .position(|h| h == "stop_sequence")
        .ok_or_else(|| GtfsError::BadFeed("stop_times.txt missing stop_sequence".into()))?;
    let idx_stop = headers
        .iter()
        .position(|h| h == "stop_id")
        .ok_or_else(|| GtfsError::BadFeed("stop_times.txt missing stop_id".into()))?;
    let idx_arr = headers.iter().position(|h| h == "arrival_time");
    let idx_dep = headers.iter().position(|h| h == "departure_time");
    let idx_headsign = headers.iter().position(|h| h == "stop_headsign");
    let idx_pickup = headers.iter().position(|h| h == "pickup_type");
    let idx_dropoff = headers.iter().position(|h| h == "drop_off_type");
    let idx_dist = headers.iter().position(|h| h == "shape_dist_traveled");

    let mut stop_times: HashMap<String, Vec<StopTime>> = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let trip_id = record.get(idx_trip).unwrap_or("").to_string();
        if trip_id.is_empty() {
            skipped += 1;
            continue;
        }
        let st = StopTime {
            stop_sequence: record
                .get(idx_seq)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            stop_id: record.get(idx_stop).unwrap_or("").to_string(),
            arrival_secs: idx_arr.and_then(|i| record.get(i)).and_then(parse_gtfs_time),
            departure_secs: idx_dep.and_then(|i| record.get(i)).and_then(parse_gtfs_time),
            stop_headsign: idx_headsign.and_then(|i| record.get(i)).and_then(non_empty),
            pickup_type: idx_pickup
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            drop_off_type: idx_dropoff
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            shape_dist_traveled: idx_dist
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok()),
        };
        stop_times.entry(trip_id).or_default().push(st);
    }
    if skipped > 0 {
        warn!(skipped, "Skipped stop_times.txt records with empty trip_id");
    }

    for sts in stop_times.values_mut() {
        sts.sort_by_key(|st| st.stop_sequence);
    }

    Ok(stop_times)
}

fn parse_shapes(archive: &mut Archive) -> HashMap<String, Vec<ShapePoint>> {
    let file = match archive.by_name("shapes.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No shapes.txt in GTFS zip (optional file)");
            return HashMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return HashMap::new(),
    };

    let idx_id = headers.iter().position(|h| h == "shape_id");
    let idx_lat = headers.iter().position(|h| h == "shape_pt_lat");
    let idx_lon = headers.iter().position(|h| h == "shape_pt_lon");
    let idx_seq = headers.iter().position(|h| h == "shape_pt_sequence");
    let idx_dist = headers.iter().position(|h| h == "shape_dist_traveled");

    let (Some(idx_id), Some(idx_lat), Some(idx_lon), Some(idx_seq)) =
        (idx_id, idx_lat, idx_lon, idx_seq)
    else {
        return HashMap::new();
    };

    let mut shapes: HashMap<String, Vec<ShapePoint>> = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let Ok(record) = result else {
            skipped += 1;
            continue;
        };
        let shape_id = record.get(idx_id).unwrap_or("").to_string();
        let lat = record.get(idx_lat).and_then(|s| s.parse().ok());
        let lon = record.get(idx_lon).and_then(|s| s.parse().ok());
        let sequence = record.get(idx_seq).and_then(|s| s.parse().ok());
        let (Some(lat), Some(lon), Some(sequence)) = (lat, lon, sequence) else {
            skipped += 1;
            continue;
        };
        if shape_id.is_empty() {
            skipped += 1;
            continue;
        }
        shapes.entry(shape_id).or_default().push(ShapePoint {
            sequence,
            lat,
            lon,
            dist_traveled: idx_dist
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok()),
        });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped shapes.txt records (empty/unparseable)");
    }

    for points in shapes.values_mut() {
        points.sort_by_key(|p| p.sequence);
    }

    shapes
}

fn parse_calendar(archive: &mut Archive) -> HashMap<String, Calendar> {
    let file = match archive.by_name("calendar.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No calendar.txt in GTFS zip (optional file)");
            return HashMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return HashMap::new(),
    };

    let idx_service = headers.iter().position(|h| h == "service_id");
    let idx_days = [
        headers.iter().position(|h| h == "monday"),
        headers.iter().position(|h| h == "tuesday"),
        headers.iter().position(|h| h == "wednesday"),
        headers.iter().position(|h| h == "thursday"),
        headers.iter().position(|h| h == "friday"),
        headers.iter().position(|h| h == "saturday"),
        headers.iter().position(|h| h == "sunday"),
    ];
    let idx_start = headers.iter().position(|h| h == "start_date");
    let idx_end = headers.iter().position(|h| h == "end_date");

    let Some(idx_service) = idx_service else {
        return HashMap::new();
    };

    let mut calendars = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let Ok(record) = result else {
            skipped += 1;
            continue;
        };
        let service_id = record.get(idx_service).unwrap_or("").to_string();
        if service_id.is_empty() {
            skipped += 1;
            continue;
        }

        let get_bool = |idx: Option<usize>| -> bool {
            idx.and_then(|i| record.get(i))
                .and_then(|s| s.parse::<i32>().ok())
                .map(|v| v == 1)
                .unwrap_or(false)
        };

        let start_date = idx_start.and_then(|i| record.get(i)).and_then(parse_gtfs_date);
        let end_date = idx_end.and_then(|i| record.get(i)).and_then(parse_gtfs_date);
        let (Some(start_date), Some(end_date)) = (start_date, end_date) else {
            skipped += 1;
            continue;
        };

        let mut days = [false; 7];
        for (day, idx) in days.iter_mut().zip(idx_days) {
            *day = get_bool(idx);
        }

        calendars.insert(
            service_id.clone(),
            Calendar {
                service_id,
                days,
                start_date,
                end_date,
            },
        );
    }
    if skipped > 0 {
        warn!(skipped, "Skipped calendar.txt records (empty/unparseable)");
    }
    calendars
}

fn parse_calendar_dates(archive: &mut Archive) -> HashMap<String, Vec<CalendarDate>> {
    let file = match archive.by_name("calendar_dates.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No calendar_dates.txt in GTFS zip (optional file)");
            return HashMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return HashMap::new(),
    };

    let idx_service = headers.iter().position(|h| h == "service_id");
    let idx_date = headers.iter().position(|h| h == "date");
    let idx_type = headers.iter().position(|h| h == "exception_type");

    let (Some(idx_service), Some(idx_date), Some(idx_type)) = (idx_service, idx_date, idx_type)
    else {
        return HashMap::new();
    };

    let mut dates: HashMap<String, Vec<CalendarDate>> = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let Ok(record) = result else {
            skipped += 1;
            continue;
        };
        let service_id = record.get(idx_service).unwrap_or("").to_string();
        if service_id.is_empty() {
            skipped += 1;
            continue;
        }
        let Some(date) = record.get(idx_date).and_then(parse_gtfs_date) else {
            skipped += 1;
            continue;
        };
        let exception_type = record.get(idx_type).and_then(|s| s.parse().ok()).unwrap_or(0);

        dates.entry(service_id).or_default().push(CalendarDate {
            date,
            exception_type,
        });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped calendar_dates.txt records (empty/unparseable)");
    }
    dates
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A minimal store: one agency (America/Los_Angeles), three stops on a
    /// line, two interlined trips in block "blk1" plus a blockless trip,
    /// weekday service, one shape.
    pub fn store() -> StaticStore {
        let mut agencies = HashMap::new();
        agencies.insert(
            "unitrans".to_string(),
            Agency {
                agency_id: "unitrans".to_string(),
                name: "Unitrans".to_string(),
                url: Some("https://unitrans.example".to_string()),
                timezone: "America/Los_Angeles".to_string(),
                lang: Some("en".to_string()),
            },
        );

        let mut stops = HashMap::new();
        for (id, lat, lon) in [
            ("22005", 38.5400, -121.7600),
            ("22010", 38.5450, -121.7450),
            ("22020", 38.5500, -121.7300),
        ] {
            stops.insert(
                id.to_string(),
                Stop {
                    stop_id: id.to_string(),
                    code: Some(id.to_string()),
                    name: Some(format!("Stop {}", id)),
                    lat,
                    lon,
                    location_type: 0,
                    wheelchair_boarding: WheelchairBoarding::Unknown,
                    parent_station: None,
                    direction: None,
                },
            );
        }

        let mut routes = HashMap::new();
        routes.insert(
            "route_g".to_string(),
            Route {
                route_id: "route_g".to_string(),
                agency_id: Some("unitrans".to_string()),
                short_name: Some("G".to_string()),
                long_name: Some("G Line".to_string()),
                description: None,
                route_type: 3,
                color: None,
                text_color: None,
            },
        );

        let mut trips = HashMap::new();
        for (trip_id, block) in [
            ("trip_0800", Some("blk1")),
            ("trip_1000", Some("blk1")),
            ("trip_solo", None),
        ] {
            trips.insert(
                trip_id.to_string(),
                Trip {
                    trip_id: trip_id.to_string(),
                    route_id: "route_g".to_string(),
                    service_id: "weekday".to_string(),
                    headsign: Some("Downtown".to_string()),
                    direction_id: Some(0),
                    block_id: block.map(|b| b.to_string()),
                    shape_id: Some("shp1".to_string()),
                },
            );
        }

        let make_stop_times = |base: i32| -> Vec<StopTime> {
            [("22005", 0), ("22010", 600), ("22020", 1200)]
                .iter()
                .enumerate()
                .map(|(i, (stop_id, offset))| StopTime {
                    stop_sequence: (i + 1) as u32,
                    stop_id: stop_id.to_string(),
                    arrival_secs: Some(base + offset),
                    departure_secs: Some(base + offset + 30),
                    stop_headsign: None,
                    pickup_type: 0,
                    drop_off_type: 0,
                    shape_dist_traveled: None,
                })
                .collect()
        };

        let mut stop_times = HashMap::new();
        stop_times.insert("trip_0800".to_string(), make_stop_times(8 * 3600));
        stop_times.insert("trip_1000".to_string(), make_stop_times(10 * 3600));
        stop_times.insert("trip_solo".to_string(), make_stop_times(12 * 3600));

        let mut shapes = HashMap::new();
        shapes.insert(
            "shp1".to_string(),
            vec![
                (38.5400, -121.7600),
                (38.5450, -121.7450),
                (38.5500, -121.7300),
            ]
            .into_iter()
            .enumerate()
            .map(|(i, (lat, lon))| ShapePoint {
                sequence: i as u32,
                lat,
                lon,
                dist_traveled: None,
            })
            .collect(),
        );

        let mut calendars = HashMap::new();
        calendars.insert(
            "weekday".to_string(),
            Calendar {
                service_id: "weekday".to_string(),
                days: [true, true, true, true, true, false, false],
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            },
        );

        let mut trips_by_stop: HashMap<String, HashSet<String>> = HashMap::new();
        for (trip_id, sts) in &stop_times {
            for st in sts {
                trips_by_stop
                    .entry(st.stop_id.clone())
                    .or_default()
                    .insert(trip_id.clone());
            }
        }

        let mut trips_by_block: HashMap<String, Vec<String>> = HashMap::new();
        for trip in trips.values() {
            if let Some(block_id) = &trip.block_id {
                trips_by_block
                    .entry(block_id.clone())
                    .or_default()
                    .push(trip.trip_id.clone());
            }
        }
        for members in trips_by_block.values_mut() {
            members.sort();
        }

        StaticStore {
            agencies,
            agency_order: vec!["unitrans".to_string()],
            stops,
            routes,
            trips,
            stop_times,
            shapes,
            calendars,
            calendar_dates: HashMap::new(),
            trips_by_stop,
            trips_by_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gtfs_time() {
        assert_eq!(parse_gtfs_time("08:30:00"), Some(30600));
        assert_eq!(parse_gtfs_time("00:00:00"), Some(0));
        assert_eq!(parse_gtfs_time("24:00:00"), Some(86400));
        assert_eq!(parse_gtfs_time("25:30:00"), Some(91800));
        assert_eq!(parse_gtfs_time(" 8:30:00"), Some(30600));
        assert_eq!(parse_gtfs_time("08:61:00"), None);
        assert_eq!(parse_gtfs_time("08:30"), None);
        assert_eq!(parse_gtfs_time("invalid"), None);
        assert_eq!(parse_gtfs_time(""), None);
    }

    #[test]
    fn test_parse_gtfs_date() {
        assert_eq!(
            parse_gtfs_date("20240610"),
            Some(NaiveDate::from_ymd_opt(2024, 6, 10).unwrap())
        );
        assert_eq!(parse_gtfs_date("20240229"), Some(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        assert_eq!(parse_gtfs_date("20230229"), None);
        assert_eq!(parse_gtfs_date("2024061"), None);
        assert_eq!(parse_gtfs_date(""), None);
    }

    #[test]
    fn test_wheelchair_boarding_mapping() {
        assert_eq!(WheelchairBoarding::from_gtfs(None), WheelchairBoarding::Unknown);
        assert_eq!(WheelchairBoarding::from_gtfs(Some(0)), WheelchairBoarding::Unknown);
        assert_eq!(WheelchairBoarding::from_gtfs(Some(1)), WheelchairBoarding::Accessible);
        assert_eq!(WheelchairBoarding::from_gtfs(Some(2)), WheelchairBoarding::NotAccessible);
        assert_eq!(WheelchairBoarding::Accessible.as_str(), "ACCESSIBLE");
    }

    #[test]
    fn test_is_service_active_weekday() {
        let store = test_fixtures::store();
        // 2024-06-10 is a Monday, 2024-06-08 a Saturday
        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let saturday = NaiveDate::from_ymd_opt(2024, 6, 8).unwrap();
        assert!(store.is_service_active("weekday", monday));
        assert!(!store.is_service_active("weekday", saturday));
        assert!(!store.is_service_active("unknown", monday));
    }

    #[test]
    fn test_is_service_active_exceptions_override() {
        let mut store = test_fixtures::store();
        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let saturday = NaiveDate::from_ymd_opt(2024, 6, 8).unwrap();

        store.calendar_dates.insert(
            "weekday".to_string(),
            vec![
                CalendarDate { date: monday, exception_type: 2 },
                CalendarDate { date: saturday, exception_type: 1 },
            ],
        );

        assert!(!store.is_service_active("weekday", monday));
        assert!(store.is_service_active("weekday", saturday));
    }

    #[test]
    fn test_is_service_active_outside_range() {
        let store = test_fixtures::store();
        let before = NaiveDate::from_ymd_opt(2023, 6, 12).unwrap();
        let after = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        assert!(!store.is_service_active("weekday", before));
        assert!(!store.is_service_active("weekday", after));
    }

    #[test]
    fn test_active_service_ids_includes_exception_only_services() {
        let mut store = test_fixtures::store();
        let special = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        store.calendar_dates.insert(
            "holiday_only".to_string(),
            vec![CalendarDate { date: special, exception_type: 1 }],
        );

        let active = store.active_service_ids(special);
        assert!(active.contains("holiday_only"));
        assert!(active.contains("weekday")); // 2024-07-04 is a Thursday

        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let active = store.active_service_ids(monday);
        assert!(!active.contains("holiday_only"));
    }

    #[test]
    fn test_agency_fallbacks() {
        let store = test_fixtures::store();
        assert_eq!(store.default_agency().unwrap().agency_id, "unitrans");
        assert_eq!(
            store.agency_for_trip("trip_0800").unwrap().agency_id,
            "unitrans"
        );
        assert!(store.agency_for_trip("nope").is_none());
    }

    #[test]
    fn test_agency_tz_fallback_to_utc() {
        let agency = Agency {
            agency_id: "x".to_string(),
            name: "X".to_string(),
            url: None,
            timezone: "Not/AZone".to_string(),
            lang: None,
        };
        assert_eq!(agency.tz(), chrono_tz::Tz::UTC);

        let agency = Agency { timezone: "America/Los_Angeles".to_string(), ..agency };
        assert_eq!(agency.tz(), chrono_tz::America::Los_Angeles);
    }

    #[test]
    fn test_stop_time_fallbacks() {
        let st = StopTime {
            stop_sequence: 1,
            stop_id: "s".to_string(),
            arrival_secs: Some(100),
            departure_secs: None,
            stop_headsign: None,
            pickup_type: 0,
            drop_off_type: 0,
            shape_dist_traveled: None,
        };
        assert_eq!(st.arrival_or_departure(), Some(100));
        assert_eq!(st.departure_or_arrival(), Some(100));
    }

    #[test]
    fn test_block_index_sorted() {
        let store = test_fixtures::store();
        assert_eq!(store.trips_in_block("blk1"), ["trip_0800", "trip_1000"]);
        assert!(store.trips_in_block("missing").is_empty());
    }

    #[test]
    fn test_trip_polyline() {
        let store = test_fixtures::store();
        let line = store.trip_polyline("trip_0800");
        assert_eq!(line.len(), 3);
        assert!(store.trip_polyline("nope").is_empty());
    }
}
