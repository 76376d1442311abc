//! Emergency settings and critical thresholds.
//!
//! Both structs carry `#[serde(default)]` so that a partially written
//! record (or an older schema) merges over the documented defaults on
//! load instead of failing deserialization.

use serde::{Deserialize, Serialize};

/// Critical range per monitored vital sign. A reading outside the range
/// produces a violation reason and (when auto-call is enabled) opens an
/// emergency episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalThresholds {
    pub heart_rate_min: f32,
    pub heart_rate_max: f32,
    pub temperature_min: f32,
    pub temperature_max: f32,
    pub oxygen_saturation_min: f32,
}

impl Default for CriticalThresholds {
    fn default() -> Self {
        Self {
            heart_rate_min: 40.0,
            heart_rate_max: 150.0,
            temperature_min: 35.0,
            temperature_max: 40.0,
            oxygen_saturation_min: 85.0,
        }
    }
}

/// User-configurable emergency behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencySettings {
    /// Master switch: violations open an episode only when enabled.
    pub auto_call_enabled: bool,
    /// Countdown length before dialing starts.
    pub auto_call_delay_secs: u32,
    /// When disabled, alert bundles are composed without location even
    /// if a fix is available.
    pub location_sharing_enabled: bool,
    /// When disabled, the medical block is omitted from alert bundles.
    pub medical_info_sharing_enabled: bool,
    pub thresholds: CriticalThresholds,
}

impl Default for EmergencySettings {
    fn default() -> Self {
        Self {
            auto_call_enabled: false,
            auto_call_delay_secs: 30,
            location_sharing_enabled: true,
            medical_info_sharing_enabled: true,
            thresholds: CriticalThresholds::default(),
        }
    }
}
