//! Alert message composition.
//!
//! Pure function: profile, violation reasons, trigger time, and an
//! optional location go in; a human-readable bundle comes out. Missing
//! optional fields become explicit placeholders; the text never omits a
//! section silently and composition never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::location::Location;
use crate::patient::PatientProfile;

/// Token used in place of a maps link when no fix is available (or
/// location sharing is disabled). Kept stable: receiving software keys
/// off it.
pub const LOCATION_UNAVAILABLE: &str = "location unavailable";

/// Placeholder for missing patient profile fields.
pub const NOT_PROVIDED: &str = "not provided";

/// Fallback patient name.
const GENERIC_PATIENT: &str = "Patient";

/// Composed alert plus its recipient phone list, handed to the
/// dispatcher as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBundle {
    pub text: String,
    pub recipients: Vec<String>,
}

/// Build the alert bundle.
///
/// `include_medical` mirrors the medical-info sharing setting; when
/// false the medical block is omitted entirely.
pub fn compose(
    profile: &PatientProfile,
    reasons: &[String],
    triggered_at: DateTime<Utc>,
    location: Option<&Location>,
    include_medical: bool,
    recipients: Vec<String>,
) -> MessageBundle {
    let patient = profile.name.as_deref().unwrap_or(GENERIC_PATIENT);

    let location_line = match location {
        Some(loc) => format!(
            "Location: https://maps.google.com/?q={},{}",
            loc.latitude, loc.longitude
        ),
        None => format!("Location: {LOCATION_UNAVAILABLE}"),
    };

    let mut text = format!(
        "MEDICAL EMERGENCY - {patient}\n\
         Reason: {}\n\
         Time: {}\n\
         {location_line}",
        reasons.join(", "),
        triggered_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );

    if include_medical {
        let field = |value: &Option<String>| -> String {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(NOT_PROVIDED)
                .to_string()
        };
        text.push_str(&format!(
            "\nMedical conditions: {}\nAllergies: {}\nBlood type: {}",
            field(&profile.medical_conditions),
            field(&profile.allergies),
            field(&profile.blood_type),
        ));
    }

    text.push_str("\n- CardioGuard");

    MessageBundle { text, recipients }
}
