//! CardioGuard: emergency detection and escalation engine for a
//! cardiac-monitoring dashboard.
//!
//! The engine watches periodic vital-sign snapshots, opens an emergency
//! episode when a reading crosses a critical threshold, runs a
//! cancellable auto-call countdown, and escalates through the contact
//! directory in two waves (primary first, everyone else after a delay).
//! Telephony, geolocation, and persistence are injected seams; the
//! engine itself is pure orchestration.

pub mod config;
pub mod contacts;
pub mod dispatch;
pub mod engine;
pub mod episode;
pub mod error;
pub mod location;
pub mod message;
pub mod patient;
pub mod settings;
pub mod store;
pub mod vitals;

pub use engine::{EmergencyEngine, EngineSnapshot};
pub use error::EmergencyError;
