//! Best-effort, timeout-bounded geolocation.
//!
//! `LocationSource` is the seam to the platform fetch (an external
//! collaborator). `LocationProvider` wraps it with a timeout and a
//! last-known cache; it returns `Option<Location>` and never fails, since
//! callers treat location as optional and proceed without it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fetch timeout matching the original high-accuracy lookup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached fixes younger than this are served without a new fetch.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy radius in meters.
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

impl Location {
    /// Age of the fix relative to now. Future timestamps count as fresh.
    fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable: {0}")]
    Unavailable(String),
}

/// Raw platform fetch. Implementations perform one high-accuracy lookup
/// attempt; the provider handles timeout and caching.
pub trait LocationSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<Location, LocationError>>;
}

pub struct LocationProvider {
    source: Arc<dyn LocationSource>,
    cached: Mutex<Option<Location>>,
}

impl LocationProvider {
    pub fn new(source: Arc<dyn LocationSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Attempt a location fix bounded by `timeout`. A cached fix younger
    /// than `max_age` is returned without fetching. Timeout, permission
    /// failure, and unavailability all yield `None`.
    pub async fn request_location(&self, timeout: Duration, max_age: Duration) -> Option<Location> {
        if let Ok(cached) = self.cached.lock() {
            if let Some(loc) = cached.as_ref() {
                if loc.age() < max_age {
                    return Some(loc.clone());
                }
            }
        }

        match tokio::time::timeout(timeout, self.source.fetch()).await {
            Ok(Ok(loc)) => {
                if let Ok(mut cached) = self.cached.lock() {
                    *cached = Some(loc.clone());
                }
                Some(loc)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "location fetch failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "location fetch timed out");
                None
            }
        }
    }

    /// Last successful fix regardless of age.
    pub fn last_known(&self) -> Option<Location> {
        self.cached.lock().ok().and_then(|c| c.clone())
    }
}
