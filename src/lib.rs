pub mod acquisition;
pub mod channels;
pub mod database;
pub mod device;

use chrono::prelude::*;
use dotenvy::dotenv;
use std::env;

pub type Timestamp = DateTime<Utc>;

const DATABASE_URL: &str = "DATABASE_URL";
const DEFAULT_DATABASE: &str = "results.sqlite3";

pub fn get_database_url() -> String {
    dotenv().ok();
    env::var(DATABASE_URL).unwrap_or_else(|_| String::from(DEFAULT_DATABASE))
}

// The runs/measurements tables keep unix timestamps in fractional seconds
pub fn unix_seconds(tstamp: Timestamp) -> f64 {
    tstamp.timestamp_micros() as f64 * 1e-6
}
