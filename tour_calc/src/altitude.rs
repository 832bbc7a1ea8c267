//! Altitude series adjustment.

use ndarray::{ArrayView1, Zip};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::TourError;

pub const MIN_TARGET_ALTITUDE: i32 = 0;
pub const MAX_TARGET_ALTITUDE: i32 = 6000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdjustPolicy {
    /// Shift the whole tour so the first sample lands on the target.
    Even,
    /// Move the last sample onto the target, spreading the correction by distance.
    EndAnchored,
    /// Scale heights above the start so the highest point lands on the target.
    MaxHeightAnchored,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AltitudeAdjustment {
    pub policy: AdjustPolicy,
    pub target_altitude: i32,
}

impl AltitudeAdjustment {
    pub fn new(policy: AdjustPolicy, target_altitude: i32) -> Self {
        Self {
            policy,
            target_altitude,
        }
    }

    pub fn validate(&self) -> Result<(), TourError> {
        if !(MIN_TARGET_ALTITUDE..=MAX_TARGET_ALTITUDE).contains(&self.target_altitude) {
            return Err(TourError::InvalidInput(format!(
                "target altitude {} outside {}..={}",
                self.target_altitude, MIN_TARGET_ALTITUDE, MAX_TARGET_ALTITUDE
            )));
        }
        Ok(())
    }
}

/// Return a new altitude series adjusted according to `request`.
pub fn adjust_altitude(
    altitude: &[f64],
    distance: &[f64],
    request: &AltitudeAdjustment,
) -> Result<Vec<f64>, TourError> {
    request.validate()?;
    if altitude.is_empty() {
        return Err(TourError::InvalidInput("altitude series is empty".into()));
    }
    if altitude.len() != distance.len() {
        return Err(TourError::InvalidInput(format!(
            "distance series has {} samples, altitude series has {}",
            distance.len(),
            altitude.len()
        )));
    }
    if altitude.iter().chain(distance).any(|v| !v.is_finite()) {
        return Err(TourError::InvalidInput(
            "series contain non-finite values".into(),
        ));
    }

    let target = request.target_altitude as f64;
    let alti = ArrayView1::from(altitude);

    let adjusted = match request.policy {
        AdjustPolicy::Even => {
            let diff = target - altitude[0];
            alti.mapv(|a| a + diff)
        }
        AdjustPolicy::EndAnchored => {
            let last = altitude.len() - 1;
            let tour_distance = distance[last];
            if tour_distance <= 0.0 {
                return Err(TourError::DegenerateInput(
                    "tour distance is zero, cannot spread end correction".into(),
                ));
            }
            let end_diff = target - altitude[last];
            Zip::from(&alti)
                .and(&ArrayView1::from(distance))
                .map_collect(|&a, &d| a + (end_diff * (d / tour_distance)).trunc())
        }
        AdjustPolicy::MaxHeightAnchored => {
            let start = altitude[0];
            let max = altitude
                .iter()
                .copied()
                .map(OrderedFloat)
                .max()
                .map(OrderedFloat::into_inner)
                .unwrap_or(start);
            let max_h0 = max - start;
            let target_h0 = target - start;
            if target_h0 == 0.0 {
                return Err(TourError::DegenerateInput(
                    "target altitude equals start altitude".into(),
                ));
            }
            if max_h0 == 0.0 {
                return Err(TourError::DegenerateInput(
                    "no sample rises above the start altitude".into(),
                ));
            }
            let ratio = max_h0 / target_h0;
            alti.mapv(|a| (a - start) / ratio + start)
        }
    };

    Ok(adjusted.to_vec())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AltitudeUpDown {
    pub up_m: f64,
    pub down_m: f64,
}

/// Accumulated ascent and descent, ignoring changes smaller than `eps_m`.
pub fn altitude_up_down(altitude: &[f64], eps_m: f64) -> AltitudeUpDown {
    let mut out = AltitudeUpDown::default();
    let Some(&first) = altitude.first() else {
        return out;
    };
    let eps = eps_m.max(0.0);
    let mut reference = first;
    for w in altitude.windows(2) {
        let z = w[1];
        if eps <= 0.0 {
            let dv = z - w[0];
            if dv > 0.0 {
                out.up_m += dv;
            } else {
                out.down_m -= dv;
            }
        } else if z >= reference + eps {
            out.up_m += z - reference;
            reference = z;
        } else if z <= reference - eps {
            out.down_m += reference - z;
            reference = z;
        }
    }
    out
}
