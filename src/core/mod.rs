//! Pure computation: everything between the GTFS stores and the wire DTOs.

pub mod arrivals;
pub mod blocks;
pub mod prediction;
pub mod schedule;
pub mod service_day;
pub mod trip_status;
