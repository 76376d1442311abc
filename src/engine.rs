//! Emergency detection and escalation engine.
//!
//! State machine: Idle → Triggered → CountingDown → Dialing → Completed,
//! with Cancelled reachable from any non-terminal state. The engine owns
//! at most one episode at a time; every mutation goes through the episode
//! mutex, and the check-and-create under that lock is what guarantees the
//! single-episode invariant under concurrent `evaluate` calls.
//!
//! Three timers exist per episode, each a spawned task whose handle is
//! kept so cancellation can abort it:
//! - the 1 s countdown ticker (live while CountingDown),
//! - the one-shot secondary-wave timer (live while Dialing, until fired),
//! - the terminal-clear grace timer.
//!
//! Dial attempts run as detached tasks: cancelling an episode aborts the
//! timers but lets in-flight calls finish and record their outcome.
//! Timer bodies re-check episode status before acting, so an aborted-but-
//! already-polled task can never dial on a cancelled episode.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::contacts::{Contact, ContactDirectory, ContactPatch, NewContact};
use crate::dispatch::AlertDispatcher;
use crate::episode::{AttemptStatus, ContactAttempt, EmergencyEpisode, EpisodeStatus};
use crate::error::EmergencyError;
use crate::location::{Location, LocationProvider, LocationSource, DEFAULT_MAX_AGE, DEFAULT_TIMEOUT};
use crate::message::{self, MessageBundle};
use crate::patient::PatientProfile;
use crate::settings::EmergencySettings;
use crate::store::Repository;
use crate::vitals::{self, VitalsSnapshot};

/// Delay between the primary call and the secondary escalation wave.
const SECONDARY_WAVE_DELAY: Duration = Duration::from_secs(30);

/// Grace period before a terminal episode is dereferenced.
const TERMINAL_CLEAR_GRACE: Duration = Duration::from_secs(5);

/// Terminal episodes retained for review.
const HISTORY_CAP: usize = 50;

/// Snapshot fan-out buffer; slow subscribers lag rather than block.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Immutable copy of engine state handed to subscribers on every
/// relevant mutation (contact change, settings change, episode state
/// change, countdown tick).
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub contacts: Vec<Contact>,
    pub patient: PatientProfile,
    pub settings: EmergencySettings,
    pub active_episode: Option<EmergencyEpisode>,
    pub location: Option<Location>,
}

/// Armed timer handles for the current episode.
#[derive(Default)]
struct Timers {
    countdown: Option<JoinHandle<()>>,
    wave: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

struct EngineInner {
    directory: ContactDirectory,
    location: LocationProvider,
    dispatcher: Arc<dyn AlertDispatcher>,
    settings: RwLock<EmergencySettings>,
    patient: RwLock<PatientProfile>,
    settings_store: Box<dyn Repository<EmergencySettings>>,
    patient_store: Box<dyn Repository<PatientProfile>>,
    episode: Mutex<Option<EmergencyEpisode>>,
    timers: Mutex<Timers>,
    history: Mutex<VecDeque<EmergencyEpisode>>,
    events: broadcast::Sender<EngineSnapshot>,
}

/// The escalation engine. Construct one instance with injected
/// collaborators; all methods take `&self` and must run inside a tokio
/// runtime (timers and dial attempts are spawned tasks).
pub struct EmergencyEngine {
    inner: Arc<EngineInner>,
}

impl EmergencyEngine {
    /// Build the engine, loading the three persisted records and merging
    /// absent ones over defaults.
    pub fn new(
        dispatcher: Arc<dyn AlertDispatcher>,
        location_source: Arc<dyn LocationSource>,
        contact_store: Box<dyn Repository<Vec<Contact>>>,
        patient_store: Box<dyn Repository<PatientProfile>>,
        settings_store: Box<dyn Repository<EmergencySettings>>,
    ) -> Result<Self, EmergencyError> {
        let directory = ContactDirectory::load(contact_store)?;
        let settings = settings_store.load()?.unwrap_or_default();
        let patient = patient_store.load()?.unwrap_or_default();
        let (events, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(EngineInner {
                directory,
                location: LocationProvider::new(location_source),
                dispatcher,
                settings: RwLock::new(settings),
                patient: RwLock::new(patient),
                settings_store,
                patient_store,
                episode: Mutex::new(None),
                timers: Mutex::new(Timers::default()),
                history: Mutex::new(VecDeque::new()),
                events,
            }),
        })
    }

    /// Subscribe to state snapshots. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineSnapshot> {
        self.inner.events.subscribe()
    }

    /// Current state snapshot (owned copy).
    pub fn snapshot(&self) -> EngineSnapshot {
        build_snapshot(&self.inner)
    }

    /// Current episode, if one is referenced (including a terminal one
    /// inside its clearing grace window).
    pub fn active_episode(&self) -> Option<EmergencyEpisode> {
        self.inner.episode.lock().ok().and_then(|g| g.clone())
    }

    /// Terminal episodes, most recent last.
    pub fn history(&self) -> Vec<EmergencyEpisode> {
        self.inner
            .history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Evaluation & episode lifecycle ──────────────────────

    /// Evaluate one vitals snapshot. Returns the violation reasons; when
    /// non-empty, auto-call is enabled, and no episode is active, an
    /// emergency is triggered as a side effect.
    pub fn evaluate(&self, sample: &VitalsSnapshot) -> Vec<String> {
        let settings = self
            .inner
            .settings
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();

        if let Some(advisory) = vitals::blood_pressure_advisory(sample) {
            tracing::warn!(%advisory, "blood pressure advisory");
        }

        let reasons = vitals::evaluate_vitals(sample, &settings.thresholds);
        if !reasons.is_empty() {
            if settings.auto_call_enabled {
                self.trigger_emergency(reasons.clone(), sample.clone());
            } else {
                tracing::warn!(?reasons, "critical vitals, auto-call disabled");
            }
        }
        reasons
    }

    /// Open an episode and start the auto-call countdown. A no-op while
    /// any episode is still referenced (idempotency guard, not an error).
    pub fn trigger_emergency(&self, reasons: Vec<String>, sample: VitalsSnapshot) {
        let inner = &self.inner;
        let delay = inner
            .settings
            .read()
            .map(|g| g.auto_call_delay_secs)
            .unwrap_or(30);

        {
            let mut guard = match inner.episode.lock() {
                Ok(g) => g,
                Err(_) => {
                    tracing::error!("episode lock poisoned, trigger dropped");
                    return;
                }
            };
            if let Some(current) = guard.as_ref() {
                tracing::debug!(id = %current.id, "duplicate trigger ignored, episode active");
                return;
            }
            let mut episode = EmergencyEpisode::new(reasons, sample, delay);
            episode.status = EpisodeStatus::CountingDown;
            tracing::warn!(
                id = %episode.id,
                reasons = ?episode.reasons,
                countdown_secs = delay,
                "emergency triggered"
            );
            *guard = Some(episode);
        }

        // Location is fetched off the critical path; the countdown never
        // waits for it.
        let fix_task = Arc::clone(inner);
        tokio::spawn(async move {
            attach_location_fix(fix_task).await;
        });

        let countdown = tokio::spawn(run_countdown(Arc::clone(inner)));
        arm_timer(inner, |t| &mut t.countdown, countdown);

        broadcast_snapshot(inner);
    }

    /// Cancel the active episode. Valid from any non-terminal state;
    /// calling it again (or with no episode) is a no-op. Stops both the
    /// countdown and the pending secondary wave, but not in-flight dial
    /// attempts.
    pub fn cancel_emergency(&self) {
        let inner = &self.inner;

        if let Ok(mut timers) = inner.timers.lock() {
            if let Some(h) = timers.countdown.take() {
                h.abort();
            }
            if let Some(h) = timers.wave.take() {
                h.abort();
            }
        }

        let cancelled = {
            let mut guard = match inner.episode.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match guard.as_mut() {
                Some(ep) if !ep.status.is_terminal() => {
                    ep.status = EpisodeStatus::Cancelled;
                    ep.cancel_time = Some(Utc::now());
                    tracing::info!(id = %ep.id, "emergency cancelled");
                    true
                }
                _ => false,
            }
        };

        if cancelled {
            broadcast_snapshot(inner);
            schedule_clear(Arc::clone(inner));
        }
    }

    // ── Command API: contacts, profile, settings ────────────

    pub fn add_contact(&self, new: NewContact) -> Result<Uuid, EmergencyError> {
        let id = self.inner.directory.add(new)?;
        broadcast_snapshot(&self.inner);
        Ok(id)
    }

    pub fn update_contact(&self, id: Uuid, patch: ContactPatch) -> Result<(), EmergencyError> {
        self.inner.directory.update(id, patch)?;
        broadcast_snapshot(&self.inner);
        Ok(())
    }

    pub fn remove_contact(&self, id: Uuid) -> Result<(), EmergencyError> {
        self.inner.directory.remove(id)?;
        broadcast_snapshot(&self.inner);
        Ok(())
    }

    pub fn update_patient_info(&self, profile: PatientProfile) -> Result<(), EmergencyError> {
        self.inner.patient_store.save(&profile)?;
        {
            let mut guard = self
                .inner
                .patient
                .write()
                .map_err(|_| EmergencyError::LockPoisoned)?;
            *guard = profile;
        }
        broadcast_snapshot(&self.inner);
        Ok(())
    }

    pub fn update_settings(&self, settings: EmergencySettings) -> Result<(), EmergencyError> {
        self.inner.settings_store.save(&settings)?;
        {
            let mut guard = self
                .inner
                .settings
                .write()
                .map_err(|_| EmergencyError::LockPoisoned)?;
            *guard = settings;
        }
        broadcast_snapshot(&self.inner);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Timer tasks
// ═══════════════════════════════════════════════════════════

/// One-second ticker. Decrements the countdown, broadcasting every tick;
/// at zero, hands over to dialing. Exits quietly whenever the episode is
/// gone or no longer counting down.
async fn run_countdown(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let due = {
            let mut guard = match inner.episode.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            let Some(ep) = guard.as_mut() else { return };
            if ep.status != EpisodeStatus::CountingDown {
                return;
            }
            ep.countdown_seconds = ep.countdown_seconds.saturating_sub(1);
            ep.countdown_seconds == 0
        };
        broadcast_snapshot(&inner);
        if due {
            break;
        }
    }

    run_dialing(inner).await;
}

/// Transition to Dialing: resolve escalation order, dial the primary,
/// dispatch the bundle, and arm the secondary-wave timer. Completion is
/// coordinated by the wave task once every initiated future resolves.
async fn run_dialing(inner: Arc<EngineInner>) {
    let settings = inner
        .settings
        .read()
        .map(|g| g.clone())
        .unwrap_or_default();
    let profile = inner.patient.read().map(|g| g.clone()).unwrap_or_default();
    let order = inner.directory.list_active();

    let (reasons, started_at, fix) = {
        let mut guard = match inner.episode.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let Some(ep) = guard.as_mut() else { return };
        if ep.status.is_terminal() {
            return;
        }
        ep.status = EpisodeStatus::Dialing;
        tracing::info!(id = %ep.id, contacts = order.len(), "auto-call countdown elapsed, dialing");
        (ep.reasons.clone(), ep.start_time, ep.location.clone())
    };
    broadcast_snapshot(&inner);

    let shared_fix = if settings.location_sharing_enabled {
        fix
    } else {
        None
    };
    let bundle = message::compose(
        &profile,
        &reasons,
        started_at,
        shared_fix.as_ref(),
        settings.medical_info_sharing_enabled,
        order.iter().map(|c| c.phone.clone()).collect(),
    );
    if let Ok(mut guard) = inner.episode.lock() {
        if let Some(ep) = guard.as_mut() {
            ep.bundle = Some(bundle.clone());
        }
    }

    let primary = order.iter().find(|c| c.is_primary).cloned();
    let remaining: Vec<Contact> = order.into_iter().filter(|c| !c.is_primary).collect();

    // Detached tasks: cancellation must not kill an in-flight call or
    // the bundle send.
    let mut initiated: Vec<JoinHandle<()>> = Vec::new();
    if let Some(contact) = primary {
        initiated.push(tokio::spawn(dial_contact(Arc::clone(&inner), contact)));
    }
    initiated.push(tokio::spawn(send_alert_bundle(Arc::clone(&inner), bundle)));

    let wave = tokio::spawn(run_secondary_wave(Arc::clone(&inner), remaining, initiated));
    arm_timer(&inner, |t| &mut t.wave, wave);
}

/// Waits out the wave delay, dials every remaining contact concurrently,
/// then marks the episode Completed once all initiated attempts have
/// resolved. With no remaining contacts the delay is skipped.
async fn run_secondary_wave(
    inner: Arc<EngineInner>,
    remaining: Vec<Contact>,
    mut initiated: Vec<JoinHandle<()>>,
) {
    if !remaining.is_empty() {
        tokio::time::sleep(SECONDARY_WAVE_DELAY).await;

        // Defensive re-check: never dial on a cancelled episode.
        let still_dialing = inner
            .episode
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|ep| ep.status == EpisodeStatus::Dialing))
            .unwrap_or(false);
        if !still_dialing {
            return;
        }

        tracing::info!(contacts = remaining.len(), "secondary escalation wave");
        for contact in remaining {
            initiated.push(tokio::spawn(dial_contact(Arc::clone(&inner), contact)));
        }
    }

    for handle in initiated {
        let _ = handle.await;
    }

    let completed = {
        let mut guard = match inner.episode.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        match guard.as_mut() {
            Some(ep) if ep.status == EpisodeStatus::Dialing => {
                ep.status = EpisodeStatus::Completed;
                tracing::info!(
                    id = %ep.id,
                    notified = ep.contacts_notified.len(),
                    "emergency escalation completed"
                );
                true
            }
            _ => false,
        }
    };

    if completed {
        broadcast_snapshot(&inner);
        schedule_clear(inner);
    }
}

/// Dial one contact and record the attempt on the episode. The entry is
/// appended before the call and resolved after, even if the episode was
/// cancelled in between, so late results stay visible.
async fn dial_contact(inner: Arc<EngineInner>, contact: Contact) {
    {
        let mut guard = match inner.episode.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let Some(ep) = guard.as_mut() else { return };
        // One attempt per contact per episode.
        if ep
            .contacts_notified
            .iter()
            .any(|a| a.contact_id == contact.id)
        {
            return;
        }
        ep.contacts_notified.push(ContactAttempt {
            contact_id: contact.id,
            name: contact.name.clone(),
            phone: contact.phone.clone(),
            attempt_time: Utc::now(),
            status: AttemptStatus::Attempted,
        });
    }
    broadcast_snapshot(&inner);

    tracing::info!(name = %contact.name, phone = %contact.phone, "dialing emergency contact");
    let outcome = inner.dispatcher.dial(contact.clone()).await;
    let resolved = match &outcome {
        Ok(()) => AttemptStatus::Completed,
        Err(e) => {
            tracing::warn!(name = %contact.name, error = %e, "emergency dial failed");
            AttemptStatus::Failed
        }
    };

    if let Ok(mut guard) = inner.episode.lock() {
        if let Some(ep) = guard.as_mut() {
            if let Some(attempt) = ep
                .contacts_notified
                .iter_mut()
                .find(|a| a.contact_id == contact.id)
            {
                attempt.status = resolved;
            }
        }
    }
    broadcast_snapshot(&inner);
}

/// Best-effort bundle dispatch; failures are logged, never propagated.
async fn send_alert_bundle(inner: Arc<EngineInner>, bundle: MessageBundle) {
    match inner.dispatcher.send_bundle(bundle).await {
        Ok(deliveries) => {
            let delivered = deliveries.iter().filter(|d| d.delivered).count();
            tracing::info!(delivered, total = deliveries.len(), "alert bundle dispatched");
        }
        Err(e) => tracing::warn!(error = %e, "alert bundle dispatch failed"),
    }
}

/// After the grace delay, move a terminal episode into history and drop
/// the reference, leaving the engine idle again.
fn schedule_clear(inner: Arc<EngineInner>) {
    let task = Arc::clone(&inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(TERMINAL_CLEAR_GRACE).await;
        let cleared = {
            let mut guard = match task.episode.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match guard.as_ref() {
                Some(ep) if ep.status.is_terminal() => {
                    let ep = guard.take();
                    if let (Ok(mut history), Some(ep)) = (task.history.lock(), ep) {
                        history.push_back(ep);
                        while history.len() > HISTORY_CAP {
                            history.pop_front();
                        }
                    }
                    true
                }
                _ => false,
            }
        };
        if cleared {
            tracing::debug!("terminal episode cleared, engine idle");
            broadcast_snapshot(&task);
        }
    });
    arm_timer(&inner, |t| &mut t.grace, handle);
}

/// Store a timer handle, aborting any stale one in the same slot.
fn arm_timer(
    inner: &EngineInner,
    slot: impl FnOnce(&mut Timers) -> &mut Option<JoinHandle<()>>,
    handle: JoinHandle<()>,
) {
    if let Ok(mut timers) = inner.timers.lock() {
        if let Some(old) = slot(&mut timers).replace(handle) {
            old.abort();
        }
    }
}

/// Fetch a location fix and attach it to the episode if one is still
/// active when the fix arrives.
async fn attach_location_fix(inner: Arc<EngineInner>) {
    let Some(fix) = inner
        .location
        .request_location(DEFAULT_TIMEOUT, DEFAULT_MAX_AGE)
        .await
    else {
        return;
    };
    let attached = {
        let mut guard = match inner.episode.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        match guard.as_mut() {
            Some(ep) if !ep.status.is_terminal() => {
                ep.location = Some(fix);
                true
            }
            _ => false,
        }
    };
    if attached {
        broadcast_snapshot(&inner);
    }
}

fn build_snapshot(inner: &EngineInner) -> EngineSnapshot {
    EngineSnapshot {
        contacts: inner.directory.all(),
        patient: inner.patient.read().map(|g| g.clone()).unwrap_or_default(),
        settings: inner.settings.read().map(|g| g.clone()).unwrap_or_default(),
        active_episode: inner.episode.lock().ok().and_then(|g| g.clone()),
        location: inner.location.last_known(),
    }
}

fn broadcast_snapshot(inner: &EngineInner) {
    // No subscribers is fine.
    let _ = inner.events.send(build_snapshot(inner));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Delivery, DispatchError};
    use crate::location::LocationError;
    use crate::store::MemoryStore;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    /// Dispatcher that records dial order and bundles; phones listed in
    /// `fail` report a dial failure.
    #[derive(Default)]
    struct RecordingDispatcher {
        dialed: Arc<StdMutex<Vec<String>>>,
        bundles: Arc<StdMutex<Vec<MessageBundle>>>,
        fail: Vec<String>,
    }

    impl RecordingDispatcher {
        fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }

        fn bundles(&self) -> Vec<MessageBundle> {
            self.bundles.lock().unwrap().clone()
        }
    }

    impl AlertDispatcher for RecordingDispatcher {
        fn dial(&self, contact: Contact) -> BoxFuture<'static, Result<(), DispatchError>> {
            let dialed = Arc::clone(&self.dialed);
            let fail = self.fail.contains(&contact.phone);
            Box::pin(async move {
                dialed.lock().unwrap().push(contact.phone);
                if fail {
                    Err(DispatchError::Dial("no answer".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn send_bundle(
            &self,
            bundle: MessageBundle,
        ) -> BoxFuture<'static, Result<Vec<Delivery>, DispatchError>> {
            let bundles = Arc::clone(&self.bundles);
            Box::pin(async move {
                let deliveries = bundle
                    .recipients
                    .iter()
                    .map(|phone| Delivery {
                        phone: phone.clone(),
                        delivered: true,
                    })
                    .collect();
                bundles.lock().unwrap().push(bundle);
                Ok(deliveries)
            })
        }
    }

    /// Location source with no fix available.
    struct NoFixSource;

    impl LocationSource for NoFixSource {
        fn fetch(&self) -> BoxFuture<'static, Result<Location, LocationError>> {
            Box::pin(async { Err(LocationError::Unavailable("no provider".into())) })
        }
    }

    /// Location source returning a fixed position immediately.
    struct FixedSource;

    impl LocationSource for FixedSource {
        fn fetch(&self) -> BoxFuture<'static, Result<Location, LocationError>> {
            Box::pin(async {
                Ok(Location {
                    latitude: 48.8566,
                    longitude: 2.3522,
                    accuracy_m: 8.0,
                    timestamp: Utc::now(),
                })
            })
        }
    }

    fn engine_with(
        dispatcher: Arc<RecordingDispatcher>,
        source: Arc<dyn LocationSource>,
    ) -> EmergencyEngine {
        EmergencyEngine::new(
            dispatcher,
            source,
            Box::new(MemoryStore::<Vec<Contact>>::default()),
            Box::new(MemoryStore::<PatientProfile>::default()),
            Box::new(MemoryStore::<EmergencySettings>::default()),
        )
        .unwrap()
    }

    fn enable_auto_call(engine: &EmergencyEngine, delay_secs: u32) {
        let mut settings = EmergencySettings::default();
        settings.auto_call_enabled = true;
        settings.auto_call_delay_secs = delay_secs;
        engine.update_settings(settings).unwrap();
    }

    fn contact(name: &str, phone: &str, is_primary: bool) -> NewContact {
        NewContact {
            name: name.into(),
            phone: phone.into(),
            relationship: "family".into(),
            is_primary,
        }
    }

    fn low_heart_rate() -> VitalsSnapshot {
        VitalsSnapshot {
            heart_rate: Some(35.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn low_heart_rate_opens_counting_down_episode() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        enable_auto_call(&engine, 30);

        let reasons = engine.evaluate(&low_heart_rate());
        assert_eq!(reasons, vec!["heart rate critical: 35 bpm".to_string()]);

        let ep = engine.active_episode().unwrap();
        assert_eq!(ep.status, EpisodeStatus::CountingDown);
        assert_eq!(ep.countdown_seconds, 30);
        assert_eq!(ep.reasons, reasons);
    }

    #[tokio::test]
    async fn disabled_auto_call_reports_reasons_without_episode() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        // auto_call_enabled stays at its default (false)

        let reasons = engine.evaluate(&low_heart_rate());
        assert_eq!(reasons.len(), 1);
        assert!(engine.active_episode().is_none());
    }

    #[tokio::test]
    async fn duplicate_trigger_keeps_single_episode() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        enable_auto_call(&engine, 30);

        engine.evaluate(&low_heart_rate());
        let first = engine.active_episode().unwrap();

        engine.evaluate(&low_heart_rate());
        engine.trigger_emergency(vec!["again".into()], VitalsSnapshot::default());

        let current = engine.active_episode().unwrap();
        assert_eq!(current.id, first.id);
        assert_eq!(current.reasons, first.reasons);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_reaches_zero_then_dialing() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 30);
        engine.add_contact(contact("Alice", "111", true)).unwrap();
        engine.add_contact(contact("Bob", "222", false)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(31)).await;

        let ep = engine.active_episode().unwrap();
        assert_eq!(ep.status, EpisodeStatus::Dialing);
        assert_eq!(ep.countdown_seconds, 0);
        assert_eq!(dispatcher.dialed(), vec!["111".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_decrements_once_per_second() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        enable_auto_call(&engine, 30);

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let ep = engine.active_episode().unwrap();
        assert_eq!(ep.status, EpisodeStatus::CountingDown);
        assert_eq!(ep.countdown_seconds, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_freezes_countdown_and_clears_after_grace() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 30);
        engine.add_contact(contact("Alice", "111", true)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        engine.cancel_emergency();

        let ep = engine.active_episode().unwrap();
        assert_eq!(ep.status, EpisodeStatus::Cancelled);
        assert_eq!(ep.countdown_seconds, 20);
        assert!(ep.cancel_time.is_some());

        // No further tick mutates the counter.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let ep = engine.active_episode().unwrap();
        assert_eq!(ep.countdown_seconds, 20);

        // Grace elapses: episode dereferenced, moved to history, nobody
        // was dialed.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(engine.active_episode().is_none());
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, EpisodeStatus::Cancelled);
        assert!(dispatcher.dialed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        enable_auto_call(&engine, 30);

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        engine.cancel_emergency();
        let first_cancel = engine.active_episode().unwrap().cancel_time;
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.cancel_emergency();

        let ep = engine.active_episode().unwrap();
        assert_eq!(ep.status, EpisodeStatus::Cancelled);
        assert_eq!(ep.cancel_time, first_cancel, "cancel_time must not be overwritten");
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_dials_primary_first_then_wave() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 1);
        engine.add_contact(contact("A", "111", true)).unwrap();
        engine.add_contact(contact("B", "222", false)).unwrap();
        engine.add_contact(contact("C", "333", false)).unwrap();

        engine.evaluate(&low_heart_rate());

        // Primary wave only, before the 30 s wave timer fires.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(dispatcher.dialed(), vec!["111".to_string()]);
        assert_eq!(
            engine.active_episode().unwrap().status,
            EpisodeStatus::Dialing
        );

        // Wave fires: B and C both initiated (order unconstrained).
        tokio::time::sleep(Duration::from_secs(35)).await;
        let dialed = dispatcher.dialed();
        assert_eq!(dialed.len(), 3);
        assert_eq!(dialed[0], "111");
        assert!(dialed.contains(&"222".to_string()));
        assert!(dialed.contains(&"333".to_string()));

        // Everything resolved: episode completed and grace-cleared.
        let history = engine.history();
        assert_eq!(history.len(), 1);
        let ep = &history[0];
        assert_eq!(ep.status, EpisodeStatus::Completed);
        assert_eq!(ep.contacts_notified.len(), 3);
        assert!(ep
            .contacts_notified
            .iter()
            .all(|a| a.status == AttemptStatus::Completed));
        assert!(engine.active_episode().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dial_recorded_without_aborting_escalation() {
        let dispatcher = Arc::new(RecordingDispatcher {
            fail: vec!["222".to_string()],
            ..Default::default()
        });
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 1);
        engine.add_contact(contact("A", "111", true)).unwrap();
        engine.add_contact(contact("B", "222", false)).unwrap();
        engine.add_contact(contact("C", "333", false)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(40)).await;

        let history = engine.history();
        assert_eq!(history.len(), 1);
        let ep = &history[0];
        assert_eq!(ep.status, EpisodeStatus::Completed);

        let by_phone = |phone: &str| {
            ep.contacts_notified
                .iter()
                .find(|a| a.phone == phone)
                .unwrap()
                .status
        };
        assert_eq!(by_phone("111"), AttemptStatus::Completed);
        assert_eq!(by_phone("222"), AttemptStatus::Failed);
        assert_eq!(by_phone("333"), AttemptStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_dialing_suppresses_secondary_wave() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 1);
        engine.add_contact(contact("A", "111", true)).unwrap();
        engine.add_contact(contact("B", "222", false)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            engine.active_episode().unwrap().status,
            EpisodeStatus::Dialing
        );

        engine.cancel_emergency();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // Primary was dialed and recorded; the wave never fired.
        assert_eq!(dispatcher.dialed(), vec!["111".to_string()]);
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, EpisodeStatus::Cancelled);
        assert_eq!(history[0].contacts_notified.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bundle_contains_location_when_fix_available() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(FixedSource));
        enable_auto_call(&engine, 2);
        engine.add_contact(contact("A", "111", true)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let bundles = dispatcher.bundles();
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].text.contains("maps.google.com"));
        assert_eq!(bundles[0].recipients, vec!["111".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn location_sharing_disabled_degrades_bundle() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(FixedSource));
        let mut settings = EmergencySettings::default();
        settings.auto_call_enabled = true;
        settings.auto_call_delay_secs = 2;
        settings.location_sharing_enabled = false;
        engine.update_settings(settings).unwrap();
        engine.add_contact(contact("A", "111", true)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let bundles = dispatcher.bundles();
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].text.contains(crate::message::LOCATION_UNAVAILABLE));
        assert!(!bundles[0].text.contains("maps.google.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_location_degrades_bundle_without_blocking() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 2);
        engine.add_contact(contact("A", "111", true)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let bundles = dispatcher.bundles();
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].text.contains(crate::message::LOCATION_UNAVAILABLE));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_broadcast_on_every_tick() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        enable_auto_call(&engine, 3);

        let mut rx = engine.subscribe();
        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let mut countdown_values = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            if let Some(ep) = snapshot.active_episode {
                countdown_values.push(ep.countdown_seconds);
            }
        }
        // Trigger snapshot at 3, then one per tick down to 0.
        assert!(countdown_values.contains(&3));
        assert!(countdown_values.contains(&2));
        assert!(countdown_values.contains(&1));
        assert!(countdown_values.contains(&0));
        // Monotone non-increasing while counting down.
        let mut sorted = countdown_values.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(countdown_values, sorted);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_episode_clears_to_idle_and_allows_new_trigger() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher.clone(), Arc::new(NoFixSource));
        enable_auto_call(&engine, 1);
        engine.add_contact(contact("A", "111", true)).unwrap();

        engine.evaluate(&low_heart_rate());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(engine.active_episode().is_none());

        // Engine is idle again: a new violation opens a fresh episode.
        engine.evaluate(&low_heart_rate());
        let second = engine.active_episode().unwrap();
        assert_eq!(second.status, EpisodeStatus::CountingDown);
        assert_eq!(engine.history().len(), 1);
        assert_ne!(engine.history()[0].id, second.id);
    }

    #[tokio::test]
    async fn contact_commands_broadcast_snapshots() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with(dispatcher, Arc::new(NoFixSource));
        let mut rx = engine.subscribe();

        let id = engine.add_contact(contact("Alice", "111", true)).unwrap();
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.contacts.len(), 1);

        engine.remove_contact(id).unwrap();
        let snapshot = rx.try_recv().unwrap();
        assert!(snapshot.contacts.is_empty());
    }

    #[tokio::test]
    async fn settings_persist_through_store() {
        let store = Arc::new(MemoryStore::<EmergencySettings>::default());
        let engine = EmergencyEngine::new(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(NoFixSource),
            Box::new(MemoryStore::<Vec<Contact>>::default()),
            Box::new(MemoryStore::<PatientProfile>::default()),
            Box::new(store.clone()),
        )
        .unwrap();

        enable_auto_call(&engine, 12);
        let persisted = store.load().unwrap().unwrap();
        assert!(persisted.auto_call_enabled);
        assert_eq!(persisted.auto_call_delay_secs, 12);
    }
}
