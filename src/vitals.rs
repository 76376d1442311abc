//! Vital-sign snapshot and critical-threshold evaluation.
//!
//! `evaluate_vitals` is pure and deterministic: it compares one snapshot
//! against the configured thresholds and returns violation reasons in a
//! fixed priority order (heart rate, temperature, oxygen saturation).
//! Absent readings are skipped, never errors.
//!
//! Blood pressure is deliberately excluded from auto-trigger: it only
//! yields a softer, non-triggering advisory (`blood_pressure_advisory`).

use serde::{Deserialize, Serialize};

use crate::settings::CriticalThresholds;

/// One periodic reading from the sensor layer. Any subset of fields may
/// be present; missing parameters are simply not evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VitalsSnapshot {
    /// Heart rate in bpm.
    pub heart_rate: Option<f32>,
    /// Body temperature in °C.
    pub temperature: Option<f32>,
    /// Oxygen saturation in %.
    pub oxygen_saturation: Option<f32>,
    /// Systolic blood pressure in mmHg.
    pub systolic: Option<f32>,
    /// Diastolic blood pressure in mmHg.
    pub diastolic: Option<f32>,
}

/// Blood-pressure advisory bounds. Outside these, the reading is worth
/// flagging but never opens an episode on its own.
const SYSTOLIC_MIN: f32 = 80.0;
const SYSTOLIC_MAX: f32 = 180.0;
const DIASTOLIC_MIN: f32 = 50.0;
const DIASTOLIC_MAX: f32 = 110.0;

/// Compare a snapshot against critical thresholds.
///
/// Returns violation reasons in parameter priority order; empty when all
/// present readings are in range.
pub fn evaluate_vitals(vitals: &VitalsSnapshot, thresholds: &CriticalThresholds) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Some(hr) = vitals.heart_rate {
        if hr < thresholds.heart_rate_min || hr > thresholds.heart_rate_max {
            reasons.push(format!("heart rate critical: {hr} bpm"));
        }
    }

    if let Some(temp) = vitals.temperature {
        if temp < thresholds.temperature_min || temp > thresholds.temperature_max {
            reasons.push(format!("temperature critical: {temp} °C"));
        }
    }

    if let Some(spo2) = vitals.oxygen_saturation {
        if spo2 < thresholds.oxygen_saturation_min {
            reasons.push(format!("oxygen saturation critical: {spo2} %"));
        }
    }

    reasons
}

/// Non-triggering blood-pressure check. Requires both components; a
/// partial reading is skipped.
pub fn blood_pressure_advisory(vitals: &VitalsSnapshot) -> Option<String> {
    let (sys, dia) = (vitals.systolic?, vitals.diastolic?);
    let out_of_range = sys > SYSTOLIC_MAX
        || sys < SYSTOLIC_MIN
        || dia > DIASTOLIC_MAX
        || dia < DIASTOLIC_MIN;
    if out_of_range {
        Some(format!("blood pressure outside safe range: {sys}/{dia} mmHg"))
    } else {
        None
    }
}
