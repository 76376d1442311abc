//! Demo binary: runs the engine against a simulated vitals feed and a
//! logging dispatcher. Persisted records live under ~/CardioGuard/.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use cardioguard::config;
use cardioguard::contacts::{Contact, NewContact};
use cardioguard::dispatch::LoggingDispatcher;
use cardioguard::engine::EmergencyEngine;
use cardioguard::episode::EpisodeStatus;
use cardioguard::location::{Location, LocationError, LocationSource};
use cardioguard::patient::PatientProfile;
use cardioguard::settings::EmergencySettings;
use cardioguard::store::JsonFileStore;
use cardioguard::vitals::VitalsSnapshot;

/// Location source standing in for a platform geolocation API: a fixed
/// position with a little jitter, after a realistic delay.
struct SimulatedGps;

impl LocationSource for SimulatedGps {
    fn fetch(&self) -> BoxFuture<'static, Result<Location, LocationError>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let jitter: f64 = rand::thread_rng().gen_range(-0.0005..0.0005);
            Ok(Location {
                latitude: 48.8566 + jitter,
                longitude: 2.3522 + jitter,
                accuracy_m: 15.0,
                timestamp: Utc::now(),
            })
        })
    }
}

/// One simulated sensor reading. Normal ranges most of the time, with a
/// small chance of a critical excursion to exercise the escalation path.
fn sample_vitals() -> VitalsSnapshot {
    let mut rng = rand::thread_rng();
    let critical = rng.gen_bool(0.01);
    VitalsSnapshot {
        heart_rate: Some(if critical {
            rng.gen_range(25.0..38.0)
        } else {
            rng.gen_range(58.0..95.0)
        }),
        temperature: Some(rng.gen_range(36.2..37.4)),
        oxygen_saturation: Some(rng.gen_range(94.0..100.0)),
        systolic: Some(rng.gen_range(105.0..135.0)),
        diastolic: Some(rng.gen_range(65.0..85.0)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!(version = config::APP_VERSION, "starting {}", config::APP_NAME);

    let engine = EmergencyEngine::new(
        Arc::new(LoggingDispatcher),
        Arc::new(SimulatedGps),
        Box::new(JsonFileStore::<Vec<Contact>>::new(config::contacts_path())),
        Box::new(JsonFileStore::<PatientProfile>::new(config::patient_path())),
        Box::new(JsonFileStore::<EmergencySettings>::new(
            config::settings_path(),
        )),
    )?;

    seed_demo_records(&engine)?;

    // Report state transitions and countdown ticks.
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        let mut last: Option<(EpisodeStatus, u32)> = None;
        while let Ok(snapshot) = events.recv().await {
            match snapshot.active_episode {
                Some(ep) => {
                    let current = (ep.status, ep.countdown_seconds);
                    if last != Some(current) {
                        tracing::info!(
                            status = ?ep.status,
                            countdown = ep.countdown_seconds,
                            attempts = ep.contacts_notified.len(),
                            "episode update"
                        );
                        last = Some(current);
                    }
                }
                None => {
                    if last.take().is_some() {
                        tracing::info!("engine idle");
                    }
                }
            }
        }
    });

    tracing::info!("monitoring simulated vitals feed, ctrl-c to stop");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.evaluate(&sample_vitals());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// First-run seeding so the escalation path has something to dial.
fn seed_demo_records(engine: &EmergencyEngine) -> Result<(), cardioguard::EmergencyError> {
    let snapshot = engine.snapshot();

    if snapshot.contacts.is_empty() {
        engine.add_contact(NewContact {
            name: "Marie Dupont".into(),
            phone: "+33 6 01 02 03 04".into(),
            relationship: "spouse".into(),
            is_primary: true,
        })?;
        engine.add_contact(NewContact {
            name: "Dr. Laurent".into(),
            phone: "+33 1 44 55 66 77".into(),
            relationship: "physician".into(),
            is_primary: false,
        })?;
        tracing::info!("seeded demo contacts");
    }

    if !snapshot.settings.auto_call_enabled {
        let mut settings = snapshot.settings;
        settings.auto_call_enabled = true;
        settings.auto_call_delay_secs = 15;
        engine.update_settings(settings)?;
        tracing::info!("enabled auto-call for the demo (15 s countdown)");
    }

    Ok(())
}
