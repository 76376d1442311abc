//! Patient medical profile attached to alert bundles.

use serde::{Deserialize, Serialize};

/// Medical data shared with emergency contacts. Every field is optional;
/// the message composer substitutes explicit placeholders for anything
/// missing, so an empty profile is always valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientProfile {
    pub name: Option<String>,
    pub age: Option<String>,
    pub blood_type: Option<String>,
    pub allergies: Option<String>,
    pub medications: Option<String>,
    pub medical_conditions: Option<String>,
    pub emergency_contact: Option<String>,
    pub address: Option<String>,
}
