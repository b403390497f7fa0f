//! Parsed static GTFS model and the zip parser that produces it.
//!
//! Only the tables the engine consumes are read; unknown files in the
//! archive are ignored.

use std::collections::HashMap;

use async_zip::base::read::mem::ZipFileReader;
use async_zip::error::ZipError;
use chrono::{NaiveDate, Weekday};
use itertools::Itertools;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::compat::FuturesAsyncReadCompatExt;

#[derive(thiserror::Error, Debug)]
pub enum StaticParseError {
    #[error("zip error: {0}")]
    BadZipFile(#[from] ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error in {file}: {source}")]
    Csv {
        file: &'static str,
        source: csv::Error,
    },

    #[error("bad time value {0:?}")]
    BadTime(String),

    #[error("bad date value {0:?}")]
    BadDate(String),
}

pub type StaticParseResult<T> = Result<T, StaticParseError>;

const AGENCY_FILE: &str = "agency.txt";
const ROUTES_FILE: &str = "routes.txt";
const STOPS_FILE: &str = "stops.txt";
const TRANSFERS_FILE: &str = "transfers.txt";
const CALENDAR_FILE: &str = "calendar.txt";
const TRIPS_FILE: &str = "trips.txt";
const STOP_TIMES_FILE: &str = "stop_times.txt";

#[derive(Clone, Debug, Default)]
pub struct StaticFeed {
    pub agencies: Vec<ParsedAgency>,
    pub routes: Vec<ParsedRoute>,
    pub stops: Vec<ParsedStop>,
    pub transfers: Vec<ParsedTransfer>,
    pub services: HashMap<String, ParsedService>,
    pub trips: Vec<ParsedTrip>,
}

#[derive(Clone, Debug)]
pub struct ParsedAgency {
    pub id: String,
    pub name: String,
    pub url: String,
    pub timezone: String,
    pub language: Option<String>,
    pub phone: Option<String>,
    pub fare_url: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ParsedRoute {
    pub id: String,
    pub agency_id: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub text_color: Option<String>,
    pub route_type: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct ParsedStop {
    pub id: String,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_type: i32,
    pub parent_station: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ParsedTransfer {
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub transfer_type: i32,
    pub min_transfer_time: Option<u32>,
}

/// A service calendar entry: which weekdays the service runs.
#[derive(Clone, Debug, Default)]
pub struct ParsedService {
    pub id: String,
    pub days: Vec<Weekday>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ParsedService {
    pub fn runs_on(&self, day: Weekday) -> bool {
        self.days.contains(&day)
    }
}

#[derive(Clone, Debug)]
pub struct ParsedTrip {
    pub id: String,
    pub route_id: String,
    pub service_id: String,
    pub direction: Option<bool>,
    /// Ordered by stop sequence.
    pub stop_times: Vec<ParsedStopTime>,
}

impl ParsedTrip {
    /// Departure of the first stop, in seconds after midnight.
    pub fn start_time(&self) -> Option<u32> {
        let first = self.stop_times.first()?;
        first.departure_time.or(first.arrival_time)
    }

    /// Arrival at the last stop, in seconds after midnight.
    pub fn end_time(&self) -> Option<u32> {
        let last = self.stop_times.last()?;
        last.arrival_time.or(last.departure_time)
    }
}

#[derive(Clone, Debug)]
pub struct ParsedStopTime {
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: Option<u32>,
    pub departure_time: Option<u32>,
}

// Raw csv rows. Field names match the GTFS column headers; the csv crate
// maps empty fields to None.

#[derive(Debug, Deserialize)]
struct RawAgency {
    agency_id: Option<String>,
    agency_name: String,
    agency_url: String,
    agency_timezone: String,
    agency_lang: Option<String>,
    agency_phone: Option<String>,
    agency_fare_url: Option<String>,
    agency_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    route_id: String,
    agency_id: Option<String>,
    route_short_name: Option<String>,
    route_long_name: Option<String>,
    route_desc: Option<String>,
    route_type: Option<i32>,
    route_color: Option<String>,
    route_text_color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStop {
    stop_id: String,
    stop_name: Option<String>,
    stop_lat: Option<f64>,
    stop_lon: Option<f64>,
    location_type: Option<i32>,
    parent_station: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransfer {
    from_stop_id: String,
    to_stop_id: String,
    transfer_type: Option<i32>,
    min_transfer_time: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawCalendar {
    service_id: String,
    monday: i32,
    tuesday: i32,
    wednesday: i32,
    thursday: i32,
    friday: i32,
    saturday: i32,
    sunday: i32,
    start_date: String,
    end_date: String,
}

#[derive(Debug, Deserialize)]
struct RawTrip {
    trip_id: String,
    route_id: String,
    service_id: String,
    direction_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct RawStopTime {
    trip_id: String,
    stop_id: String,
    stop_sequence: u32,
    arrival_time: Option<String>,
    departure_time: Option<String>,
}

/// Extracts the tables the engine needs from a GTFS static zip archive.
pub async fn parse_static_zip(bytes: &[u8]) -> StaticParseResult<StaticFeed> {
    let zip_reader = ZipFileReader::new(bytes.to_vec()).await?;

    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    for i in 0..usize::MAX {
        let entry = match zip_reader.reader_with_entry(i).await {
            Ok(entry) => entry,
            Err(ZipError::EntryIndexOutOfBounds) => break,
            Err(e) => return Err(e.into()),
        };

        let filename = entry.entry().filename().as_str()?.to_string();
        if ![
            AGENCY_FILE,
            ROUTES_FILE,
            STOPS_FILE,
            TRANSFERS_FILE,
            CALENDAR_FILE,
            TRIPS_FILE,
            STOP_TIMES_FILE,
        ]
        .contains(&filename.as_str())
        {
            continue;
        }

        let mut reader = entry.compat();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await?;
        files.insert(filename, contents);
    }

    build_feed(&files)
}

fn build_feed(files: &HashMap<String, Vec<u8>>) -> StaticParseResult<StaticFeed> {
    let mut feed = StaticFeed::default();

    for raw in read_table::<RawAgency>(files, AGENCY_FILE)? {
        feed.agencies.push(ParsedAgency {
            // A feed with a single agency may omit the id.
            id: raw.agency_id.unwrap_or_else(|| raw.agency_name.clone()),
            name: raw.agency_name,
            url: raw.agency_url,
            timezone: raw.agency_timezone,
            language: raw.agency_lang,
            phone: raw.agency_phone,
            fare_url: raw.agency_fare_url,
            email: raw.agency_email,
        });
    }

    for raw in read_table::<RawRoute>(files, ROUTES_FILE)? {
        feed.routes.push(ParsedRoute {
            id: raw.route_id,
            agency_id: raw.agency_id,
            short_name: raw.route_short_name,
            long_name: raw.route_long_name,
            description: raw.route_desc,
            color: raw.route_color,
            text_color: raw.route_text_color,
            route_type: raw.route_type,
        });
    }

    for raw in read_table::<RawStop>(files, STOPS_FILE)? {
        feed.stops.push(ParsedStop {
            id: raw.stop_id,
            name: raw.stop_name,
            latitude: raw.stop_lat,
            longitude: raw.stop_lon,
            location_type: raw.location_type.unwrap_or(0),
            parent_station: raw.parent_station.filter(|p| !p.is_empty()),
        });
    }

    for raw in read_table::<RawTransfer>(files, TRANSFERS_FILE)? {
        feed.transfers.push(ParsedTransfer {
            from_stop_id: raw.from_stop_id,
            to_stop_id: raw.to_stop_id,
            transfer_type: raw.transfer_type.unwrap_or(0),
            min_transfer_time: raw.min_transfer_time,
        });
    }

    for raw in read_table::<RawCalendar>(files, CALENDAR_FILE)? {
        let mut days = Vec::new();
        for (flag, day) in [
            (raw.monday, Weekday::Mon),
            (raw.tuesday, Weekday::Tue),
            (raw.wednesday, Weekday::Wed),
            (raw.thursday, Weekday::Thu),
            (raw.friday, Weekday::Fri),
            (raw.saturday, Weekday::Sat),
            (raw.sunday, Weekday::Sun),
        ] {
            if flag != 0 {
                days.push(day);
            }
        }
        feed.services.insert(
            raw.service_id.clone(),
            ParsedService {
                id: raw.service_id,
                days,
                start_date: parse_gtfs_date(&raw.start_date)?,
                end_date: parse_gtfs_date(&raw.end_date)?,
            },
        );
    }

    let mut stop_times_by_trip: HashMap<String, Vec<ParsedStopTime>> = HashMap::new();
    for raw in read_table::<RawStopTime>(files, STOP_TIMES_FILE)? {
        let arrival_time = raw.arrival_time.as_deref().map(parse_gtfs_time).transpose()?;
        let departure_time = raw
            .departure_time
            .as_deref()
            .map(parse_gtfs_time)
            .transpose()?;
        stop_times_by_trip
            .entry(raw.trip_id)
            .or_default()
            .push(ParsedStopTime {
                stop_id: raw.stop_id,
                stop_sequence: raw.stop_sequence,
                arrival_time,
                departure_time,
            });
    }

    for raw in read_table::<RawTrip>(files, TRIPS_FILE)? {
        let stop_times = stop_times_by_trip
            .remove(&raw.trip_id)
            .unwrap_or_default()
            .into_iter()
            .sorted_by_key(|st| st.stop_sequence)
            .collect();
        feed.trips.push(ParsedTrip {
            id: raw.trip_id,
            route_id: raw.route_id,
            service_id: raw.service_id,
            direction: raw.direction_id.map(|d| d != 0),
            stop_times,
        });
    }

    Ok(feed)
}

fn read_table<T: for<'de> Deserialize<'de>>(
    files: &HashMap<String, Vec<u8>>,
    file: &'static str,
) -> StaticParseResult<Vec<T>> {
    let data = match files.get(file) {
        Some(data) => data,
        None => return Ok(Vec::new()),
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data.as_slice());
    reader
        .deserialize()
        .map(|row| row.map_err(|source| StaticParseError::Csv { file, source }))
        .collect()
}

/// GTFS times are `HH:MM:SS` and may exceed 24 hours for overnight trips.
fn parse_gtfs_time(value: &str) -> StaticParseResult<u32> {
    let mut parts = value.split(':');
    let (h, m, s) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s), None) => (h, m, s),
        _ => return Err(StaticParseError::BadTime(value.to_string())),
    };
    let parse = |p: &str| {
        p.trim()
            .parse::<u32>()
            .map_err(|_| StaticParseError::BadTime(value.to_string()))
    };
    Ok(parse(h)? * 3600 + parse(m)? * 60 + parse(s)?)
}

fn parse_gtfs_date(value: &str) -> StaticParseResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map_err(|_| StaticParseError::BadDate(value.to_string()))
}
