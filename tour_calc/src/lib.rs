//! Break-time detection and altitude adjustment for recorded GPS tours.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod altitude;
pub mod breaks;
pub mod config;

pub use altitude::{
    adjust_altitude, altitude_up_down, AdjustPolicy, AltitudeAdjustment, AltitudeUpDown,
};
pub use breaks::{break_time_fixed, break_time_in_range, detect_breaks, BreakTimeResult};
pub use config::{
    list_break_time_methods, BreakTimeConfig, BreakTimeMethod, CachedBreakTimeConfig,
    ConfigProvider, JsonFileProvider, StaticProvider,
};

#[derive(Error, Debug)]
pub enum TourError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("degenerate input: {0}")]
    DegenerateInput(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("insufficient data in tour")]
    InsufficientData,
    #[error("invalid break time settings: {0}")]
    Config(String),
}

/// Window over which the average speed series is computed.
const AVG_SPEED_WINDOW_S: i32 = 10;

/// One recorded sample, as read from a device file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackPoint {
    pub t: f64,
    pub alt: Option<f64>,
    pub dist: Option<f64>,
    pub speed: Option<f64>,
}

impl TrackPoint {
    fn new(t: f64) -> Self {
        Self {
            t,
            alt: None,
            dist: None,
            speed: None,
        }
    }
}

/// Parse FIT or GPX records from bytes using the provided format hint (extension).
pub fn parse_records(input: &[u8], format: &str) -> Result<Vec<TrackPoint>, TourError> {
    let format_lc = format.to_ascii_lowercase();
    if format_lc.ends_with(".fit") || format_lc == "fit" {
        parse_fit_records(input)
    } else if format_lc.ends_with(".gpx") || format_lc == "gpx" {
        parse_gpx_records(input)
    } else {
        Err(TourError::UnsupportedFormat(format.to_string()))
    }
}

fn parse_fit_records(input: &[u8]) -> Result<Vec<TrackPoint>, TourError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;
    let records = from_bytes(input).map_err(|e| TourError::FitParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut t0: Option<DateTime<Utc>> = None;

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut point = TrackPoint::new(0.0);
        let mut has_timestamp = false;
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        let utc = ts.with_timezone(&Utc);
                        let base = *t0.get_or_insert(utc);
                        point.t = (utc - base).num_milliseconds() as f64 / 1000.0;
                        has_timestamp = true;
                    }
                }
                name => apply_fit_field(&mut point, name, field.value()),
            }
        }
        if has_timestamp {
            out.push(point);
        }
    }

    Ok(out)
}

fn apply_fit_field(point: &mut TrackPoint, name: &str, value: &fitparser::Value) {
    let Some(val) = fit_value_to_f64(value) else {
        return;
    };
    match name {
        "altitude" | "enhanced_altitude" => point.alt = Some(val),
        "distance" | "enhanced_distance" => point.dist = Some(val),
        "speed" | "enhanced_speed" => point.speed = Some(val),
        _ => {}
    }
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx_records(input: &[u8]) -> Result<Vec<TrackPoint>, TourError> {
    use gpx::read;
    use std::io::Cursor;

    let gpx = read(Cursor::new(input)).map_err(|e| TourError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut base: Option<DateTime<Utc>> = None;
    let mut cumulative_dist = 0.0;
    let mut last_lat_lon: Option<(f64, f64)> = None;

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else {
                    continue;
                };
                let iso = time
                    .format()
                    .map_err(|e| TourError::GpxParse(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| TourError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                let t0 = *base.get_or_insert(utc);
                let mut record = TrackPoint::new((utc - t0).num_milliseconds() as f64 / 1000.0);
                record.alt = point.elevation;

                let geo = point.point();
                let (lat, lon) = (geo.y(), geo.x());
                if let Some((last_lat, last_lon)) = last_lat_lon {
                    cumulative_dist += haversine_distance(last_lat, last_lon, lat, lon);
                }
                record.dist = Some(cumulative_dist);
                last_lat_lon = Some((lat, lon));
                out.push(record);
            }
        }
    }
    Ok(out)
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r = 6_371_000.0_f64;
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    r * c
}

/// Aligned per-sample series of one tour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TourSeries {
    pub time: Vec<i32>,
    pub distance: Vec<f64>,
    pub altitude: Vec<f64>,
    /// Average speed in km/h * 10.
    pub speed: Vec<f64>,
    /// `Some(s)` for devices recording at a fixed `s` second rate, `None`
    /// for variable slices. FIT and GPX files are always variable.
    pub device_time_interval: Option<i32>,
}

impl TourSeries {
    /// Build aligned series from device records. Missing distance or altitude
    /// values carry the previous value forward.
    pub fn from_points(points: &[TrackPoint]) -> Result<Self, TourError> {
        let mut points: Vec<&TrackPoint> = points.iter().filter(|p| p.t.is_finite()).collect();
        if points.is_empty() {
            return Err(TourError::InsufficientData);
        }
        points.sort_by(|a, b| a.t.total_cmp(&b.t));
        points.dedup_by(|a, b| a.t.round() == b.t.round());

        let first_alt = points.iter().find_map(|p| p.alt).unwrap_or(0.0);
        let mut time = Vec::with_capacity(points.len());
        let mut distance = Vec::with_capacity(points.len());
        let mut altitude = Vec::with_capacity(points.len());
        let mut device_speed = Vec::with_capacity(points.len());
        let mut last_dist = 0.0_f64;
        let mut last_alt = first_alt;

        for p in &points {
            if let Some(d) = p.dist.filter(|d| d.is_finite()) {
                // cumulative distance never decreases
                last_dist = last_dist.max(d);
            }
            if let Some(a) = p.alt.filter(|a| a.is_finite()) {
                last_alt = a;
            }
            time.push(p.t.round() as i32);
            distance.push(last_dist);
            altitude.push(last_alt);
            device_speed.push(p.speed);
        }

        let speed = if device_speed.iter().all(Option::is_some) {
            Array1::from_iter(device_speed.into_iter().flatten()).mapv(|mps| mps * 3.6 * 10.0)
        } else {
            windowed_speed_serie(&time, &distance, AVG_SPEED_WINDOW_S)
        };

        Ok(Self {
            time,
            distance,
            altitude,
            speed: speed.to_vec(),
            device_time_interval: None,
        })
    }

    /// Mark the series as recorded at a fixed rate of `interval_s` seconds.
    pub fn with_device_time_interval(mut self, interval_s: i32) -> Result<Self, TourError> {
        if interval_s <= 0 {
            return Err(TourError::InvalidInput(format!(
                "device time interval must be > 0 (got {interval_s})"
            )));
        }
        self.device_time_interval = Some(interval_s);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn recording_time(&self) -> i32 {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    /// Breaks for the whole tour. Fixed-interval recordings use the
    /// distance-unchanged rule, variable ones use `config`.
    pub fn breaks(&self, config: &BreakTimeConfig) -> Result<BreakTimeResult, TourError> {
        match self.device_time_interval {
            Some(interval) if interval > 0 => {
                let min_slices = (breaks::FIXED_INTERVAL_MIN_BREAK_S / interval) as usize;
                let break_mask = break_time_fixed(&self.distance, min_slices);
                let total_break_seconds =
                    break_time_in_range(&self.time, &break_mask, 0, self.time.len())?;
                Ok(BreakTimeResult {
                    break_mask,
                    total_break_seconds,
                })
            }
            _ => detect_breaks(&self.time, &self.distance, Some(self.speed.as_slice()), config),
        }
    }

    pub fn moving_time(&self, config: &BreakTimeConfig) -> Result<i32, TourError> {
        let breaks = self.breaks(config)?;
        Ok(self.recording_time() - breaks.total_break_seconds)
    }
}

fn windowed_speed_serie(time: &[i32], distance: &[f64], window_s: i32) -> Array1<f64> {
    let mut out = Array1::zeros(time.len());
    let mut start = 0usize;
    for i in 1..time.len() {
        while start + 1 < i && time[i] - time[start + 1] >= window_s {
            start += 1;
        }
        let dt = time[i] - time[start];
        if dt > 0 {
            out[i] = (distance[i] - distance[start]) * 3.6 * 10.0 / dt as f64;
        }
    }
    out
}
