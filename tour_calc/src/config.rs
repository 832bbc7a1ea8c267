//! Break-time settings and the providers that supply them.
//!
//! A [`BreakTimeConfig`] is a plain value. Where it comes from is decided by a
//! [`ConfigProvider`]; [`CachedBreakTimeConfig`] keeps the last loaded snapshot
//! until someone signals a change through [`CachedBreakTimeConfig::invalidate`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::TourError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SeriesRequirement {
    Time,
    Distance,
    AvgSpeed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BreakTimeMethod {
    #[serde(rename = "by_slice_speed")]
    BySliceSpeed,
    #[serde(rename = "by_avg_speed")]
    ByAvgSpeed,
    #[serde(rename = "by_time_distance")]
    ByTimeDistance,
    #[serde(rename = "by_avg_slice_speed")]
    ByAvgSliceSpeed,
}

impl Default for BreakTimeMethod {
    fn default() -> Self {
        BreakTimeMethod::ByAvgSliceSpeed
    }
}

impl BreakTimeMethod {
    pub const ALL: [BreakTimeMethod; 4] = [
        BreakTimeMethod::ByAvgSliceSpeed,
        BreakTimeMethod::ByAvgSpeed,
        BreakTimeMethod::BySliceSpeed,
        BreakTimeMethod::ByTimeDistance,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BreakTimeMethod::BySliceSpeed => "by_slice_speed",
            BreakTimeMethod::ByAvgSpeed => "by_avg_speed",
            BreakTimeMethod::ByTimeDistance => "by_time_distance",
            BreakTimeMethod::ByAvgSliceSpeed => "by_avg_slice_speed",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BreakTimeMethod::BySliceSpeed => "Slice speed",
            BreakTimeMethod::ByAvgSpeed => "Average speed",
            BreakTimeMethod::ByTimeDistance => "Time and distance",
            BreakTimeMethod::ByAvgSliceSpeed => "Average and slice speed",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BreakTimeMethod::BySliceSpeed => {
                "A slice is a break when the speed between two samples is at or below the minimum."
            }
            BreakTimeMethod::ByAvgSpeed => {
                "A slice is a break when the recorded average speed is at or below the minimum."
            }
            BreakTimeMethod::ByTimeDistance => {
                "A break is a period longer than the shortest break time covering less than the maximum distance."
            }
            BreakTimeMethod::ByAvgSliceSpeed => {
                "A slice is a break when both the windowed average speed and the slice speed are at or below their minimums."
            }
        }
    }

    pub fn requirements(&self) -> &'static [SeriesRequirement] {
        match self {
            BreakTimeMethod::ByAvgSpeed => &[
                SeriesRequirement::Time,
                SeriesRequirement::Distance,
                SeriesRequirement::AvgSpeed,
            ],
            BreakTimeMethod::BySliceSpeed
            | BreakTimeMethod::ByTimeDistance
            | BreakTimeMethod::ByAvgSliceSpeed => {
                &[SeriesRequirement::Time, SeriesRequirement::Distance]
            }
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let normalized = id.trim();
        Self::ALL.into_iter().find(|m| m.id() == normalized)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakTimeMethodInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub requirements: Vec<SeriesRequirement>,
}

pub fn list_break_time_methods() -> Vec<BreakTimeMethodInfo> {
    BreakTimeMethod::ALL
        .into_iter()
        .map(|method| BreakTimeMethodInfo {
            id: method.id().to_string(),
            name: method.name().to_string(),
            description: method.description().to_string(),
            requirements: method.requirements().to_vec(),
        })
        .collect()
}

/// Parameters for every break-time method. Only the fields used by `method`
/// take part in a computation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakTimeConfig {
    pub method: BreakTimeMethod,
    pub shortest_break_time_s: i32,
    pub max_distance_m: f64,
    /// Slices longer than this many minutes are always breaks; 0 disables the rule.
    pub slice_diff_min: i32,
    pub min_slice_speed_kmh: f64,
    pub min_avg_speed_kmh: f64,
    pub as_min_avg_speed_kmh: f64,
    pub as_min_slice_speed_kmh: f64,
    pub as_min_slice_time_s: i32,
}

impl Default for BreakTimeConfig {
    fn default() -> Self {
        Self {
            method: BreakTimeMethod::ByAvgSliceSpeed,
            shortest_break_time_s: 20,
            max_distance_m: 20.0,
            slice_diff_min: 5,
            min_slice_speed_kmh: 1.0,
            min_avg_speed_kmh: 1.0,
            as_min_avg_speed_kmh: 1.0,
            as_min_slice_speed_kmh: 1.0,
            as_min_slice_time_s: 2,
        }
    }
}

impl BreakTimeConfig {
    pub fn validate(&self) -> Result<(), TourError> {
        if self.shortest_break_time_s < 0 {
            return Err(TourError::Config(format!(
                "shortest break time must be >= 0 (got {})",
                self.shortest_break_time_s
            )));
        }
        if self.slice_diff_min < 0 {
            return Err(TourError::Config(format!(
                "slice difference must be >= 0 minutes (got {})",
                self.slice_diff_min
            )));
        }
        if self.as_min_slice_time_s < 0 {
            return Err(TourError::Config(format!(
                "minimum slice time must be >= 0 (got {})",
                self.as_min_slice_time_s
            )));
        }
        let speeds = [
            ("max_distance_m", self.max_distance_m),
            ("min_slice_speed_kmh", self.min_slice_speed_kmh),
            ("min_avg_speed_kmh", self.min_avg_speed_kmh),
            ("as_min_avg_speed_kmh", self.as_min_avg_speed_kmh),
            ("as_min_slice_speed_kmh", self.as_min_slice_speed_kmh),
        ];
        for (name, value) in speeds {
            if !value.is_finite() || value < 0.0 {
                return Err(TourError::Config(format!(
                    "{name} must be a finite value >= 0 (got {value})"
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 of the serialized settings, hex encoded.
    pub fn fingerprint(&self) -> Result<String, TourError> {
        let bytes = serde_json::to_vec(self).map_err(|e| TourError::Config(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

pub trait ConfigProvider {
    fn load(&self) -> Result<BreakTimeConfig, TourError>;
}

/// Hands out the same explicit values on every load.
#[derive(Clone, Debug, Default)]
pub struct StaticProvider(pub BreakTimeConfig);

impl ConfigProvider for StaticProvider {
    fn load(&self) -> Result<BreakTimeConfig, TourError> {
        Ok(self.0.clone())
    }
}

/// Reads settings from a JSON object; missing keys keep their defaults.
#[derive(Clone, Debug)]
pub struct JsonFileProvider {
    path: PathBuf,
}

impl JsonFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for JsonFileProvider {
    fn load(&self) -> Result<BreakTimeConfig, TourError> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            TourError::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        parse_config_json(&text)
    }
}

pub fn parse_config_json(text: &str) -> Result<BreakTimeConfig, TourError> {
    serde_json::from_str(text).map_err(|e| TourError::Config(e.to_string()))
}

#[derive(Default)]
struct CacheState {
    current: Option<Arc<BreakTimeConfig>>,
    fingerprint: Option<String>,
}

/// Lazily loaded break-time settings shared between callers.
///
/// The snapshot handed out by [`get`](Self::get) never changes; after
/// [`invalidate`](Self::invalidate) the next `get` reloads from the provider.
pub struct CachedBreakTimeConfig<P> {
    provider: P,
    state: RwLock<CacheState>,
}

impl<P: ConfigProvider> CachedBreakTimeConfig<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn get(&self) -> Result<Arc<BreakTimeConfig>, TourError> {
        {
            let state = self.state.read().map_err(|_| poisoned())?;
            if let Some(current) = state.current.as_ref() {
                return Ok(Arc::clone(current));
            }
        }

        let mut state = self.state.write().map_err(|_| poisoned())?;
        // Another caller may have loaded while we waited for the write lock.
        if let Some(current) = state.current.as_ref() {
            return Ok(Arc::clone(current));
        }

        let config = self.provider.load()?;
        config.validate()?;
        let fingerprint = config.fingerprint()?;
        match state.fingerprint.as_deref() {
            Some(prev) if prev == fingerprint => {
                debug!("break time settings reloaded, unchanged ({})", &fingerprint[..12]);
            }
            Some(_) => debug!("break time settings changed ({})", &fingerprint[..12]),
            None => debug!(
                "break time settings loaded: method {} ({})",
                config.method.id(),
                &fingerprint[..12]
            ),
        }

        let config = Arc::new(config);
        state.current = Some(Arc::clone(&config));
        state.fingerprint = Some(fingerprint);
        Ok(config)
    }

    /// Drops the cached snapshot. Call when the underlying settings changed.
    pub fn invalidate(&self) {
        match self.state.write() {
            Ok(mut state) => {
                if state.current.take().is_some() {
                    debug!("break time settings invalidated");
                }
            }
            Err(poisoned) => {
                poisoned.into_inner().current = None;
            }
        }
    }
}

fn poisoned() -> TourError {
    TourError::Config("break time settings cache lock poisoned".into())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
