//! Cooldown-gated, bounded, retrying alert delivery.
//!
//! The poll loop hands confirmed events to [`AlertDispatcher::enqueue`], which
//! never blocks. A single worker task owns delivery: packaging, transport
//! calls, per-attempt timeouts and backoff sleeps all happen there.
//!
//! All mutable dispatcher state (pending queue, cooldown map, counters,
//! history) sits behind one mutex. The lock is never held across an await.

use crate::config::MonitorConfig;
use crate::debounce::Event;
use crate::frame_buffer::FrameBundle;
use crate::packaging::AlertPackager;
use crate::reaper::{PinLease, PinRegistry};
use crate::sensor::SensorKind;
use crate::transport::{EmailTransport, OutgoingEmail, TransportError};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status of an alert job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Sent,
    Dropped,
    Exhausted,
}

/// Why a job ended up [`JobStatus::Dropped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Evicted from a full queue by a newer job
    Displaced,
    /// Another alert of the same kind was sent first
    Cooldown,
    /// Still pending when the shutdown grace period ran out
    Shutdown,
}

/// Result of [`AlertDispatcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted after dropping the oldest pending job
    AdmittedWithDisplacement { dropped_sequence: u64 },
    /// Rejected by the cooldown gate
    Suppressed,
    /// The dispatcher no longer accepts work
    Closed,
}

/// One event on its way to the recipients.
#[derive(Debug)]
pub struct AlertJob {
    pub sequence: u64,
    pub event: Event,
    pub bundle: FrameBundle,
    pub recipients: Vec<String>,
    pub attempts: u32,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    lease: PinLease,
}

/// Terminal outcome of a job, kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_sequence: u64,
    pub event_sequence: u64,
    pub kind: SensorKind,
    pub channel_id: String,
    pub status: JobStatus,
    pub drop_reason: Option<DropReason>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub admitted: u64,
    pub suppressed: HashMap<SensorKind, u64>,
    pub displaced: u64,
    pub sent: u64,
    pub exhausted: u64,
    pub dropped_on_shutdown: u64,
    pub rejected_closed: u64,
    pub attempts: u64,
    pub notices_sent: u64,
    pub notices_failed: u64,
}

impl DispatchStats {
    pub fn suppressed_for(&self, kind: SensorKind) -> u64 {
        self.suppressed.get(&kind).copied().unwrap_or(0)
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed.values().sum()
    }
}

/// Result of [`AlertDispatcher::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Queue emptied within the grace period
    pub drained: bool,
    pub dropped_on_shutdown: usize,
    pub stats: DispatchStats,
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub cooldowns: HashMap<SensorKind, Duration>,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
    pub attempt_timeout: Duration,
    pub history_size: usize,
    pub recipients: Vec<String>,
}

impl DispatcherSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        let alerts = &config.alerts;
        Self {
            cooldowns: alerts.cooldowns(),
            queue_capacity: alerts.queue_capacity,
            max_attempts: alerts.max_attempts,
            initial_backoff: alerts.initial_backoff(),
            max_backoff: alerts.max_backoff(),
            backoff_multiplier: alerts.backoff_multiplier,
            backoff_jitter: alerts.backoff_jitter,
            attempt_timeout: alerts.attempt_timeout(),
            history_size: alerts.history_size,
            recipients: config.email.recipients.clone(),
        }
    }

    fn cooldown(&self, kind: SensorKind) -> Duration {
        self.cooldowns.get(&kind).copied().unwrap_or_default()
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.backoff_multiplier)
            .with_randomization_factor(self.backoff_jitter)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<AlertJob>,
    in_flight: Option<u64>,
    last_sent: HashMap<SensorKind, Instant>,
    stats: DispatchStats,
    history: VecDeque<JobRecord>,
    next_job: u64,
}

impl DispatchState {
    fn cooling_down(&self, kind: SensorKind, window: Duration, now: Instant) -> bool {
        self.last_sent
            .get(&kind)
            .map(|last| now.saturating_duration_since(*last) < window)
            .unwrap_or(false)
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }
}

struct Inner {
    settings: DispatcherSettings,
    transport: Arc<dyn EmailTransport>,
    packager: AlertPackager,
    pins: PinRegistry,
    state: Mutex<DispatchState>,
    wakeup: Notify,
    idle: Notify,
    accepting: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to the dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct AlertDispatcher {
    inner: Arc<Inner>,
}

enum Delivery {
    Sent,
    Exhausted(TransportError),
    Cancelled,
}

impl AlertDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        transport: Arc<dyn EmailTransport>,
        packager: AlertPackager,
        pins: PinRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                packager,
                pins,
                state: Mutex::new(DispatchState::default()),
                wakeup: Notify::new(),
                idle: Notify::new(),
                accepting: AtomicBool::new(true),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Admit an event for delivery. Never blocks on I/O.
    pub fn enqueue(&self, event: Event, bundle: FrameBundle) -> Admission {
        let inner = &self.inner;

        if !inner.accepting.load(Ordering::SeqCst) {
            inner.state.lock().stats.rejected_closed += 1;
            warn!(
                sequence = event.sequence,
                kind = %event.kind,
                "Dispatcher closed, event not enqueued"
            );
            return Admission::Closed;
        }

        let mut state = inner.state.lock();

        let window = inner.settings.cooldown(event.kind);
        if state.cooling_down(event.kind, window, Instant::now()) {
            *state.stats.suppressed.entry(event.kind).or_insert(0) += 1;
            info!(
                target: "roomguard::audit",
                sequence = event.sequence,
                kind = %event.kind,
                channel = %event.channel_id,
                cooldown_secs = window.as_secs(),
                "Alert suppressed by cooldown"
            );
            return Admission::Suppressed;
        }

        let mut admission = Admission::Admitted;
        if state.pending.len() >= inner.settings.queue_capacity {
            if let Some(oldest) = state.pending.pop_front() {
                admission = Admission::AdmittedWithDisplacement {
                    dropped_sequence: oldest.event.sequence,
                };
                state.stats.displaced += 1;
                warn!(
                    target: "roomguard::audit",
                    job = oldest.sequence,
                    sequence = oldest.event.sequence,
                    kind = %oldest.event.kind,
                    "Alert dropped by backpressure"
                );
                record(
                    &mut state,
                    oldest,
                    JobStatus::Dropped,
                    Some(DropReason::Displaced),
                    inner.settings.history_size,
                );
            }
        }

        state.next_job += 1;
        let lease = inner.pins.lease(bundle.paths().cloned());
        let job = AlertJob {
            sequence: state.next_job,
            recipients: inner.settings.recipients.clone(),
            attempts: 0,
            status: JobStatus::Pending,
            enqueued_at: Utc::now(),
            event,
            bundle,
            lease,
        };

        debug!(
            job = job.sequence,
            sequence = job.event.sequence,
            frames = job.bundle.len(),
            pending = state.pending.len() + 1,
            "Alert enqueued"
        );

        state.pending.push_back(job);
        state.stats.admitted += 1;
        drop(state);

        inner.wakeup.notify_one();
        admission
    }

    /// Start the delivery worker.
    pub fn spawn(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run_worker().await })
    }

    async fn run_worker(&self) {
        let inner = &self.inner;
        info!(
            transport = inner.transport.name(),
            capacity = inner.settings.queue_capacity,
            max_attempts = inner.settings.max_attempts,
            "Alert dispatcher started"
        );

        loop {
            let job = {
                let mut state = inner.state.lock();
                let job = state.pending.pop_front();
                state.in_flight = job.as_ref().map(|j| j.sequence);
                job
            };

            match job {
                Some(job) => {
                    self.process(job).await;
                    inner.state.lock().in_flight = None;
                }
                None => {
                    inner.idle.notify_waiters();
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = inner.wakeup.notified() => {}
                    }
                }
            }

            if inner.cancel.is_cancelled() {
                break;
            }
        }

        inner.idle.notify_waiters();
        info!("Alert dispatcher stopped");
    }

    async fn process(&self, mut job: AlertJob) {
        let inner = &self.inner;
        let history_size = inner.settings.history_size;

        {
            let mut state = inner.state.lock();
            let window = inner.settings.cooldown(job.event.kind);
            if state.cooling_down(job.event.kind, window, Instant::now()) {
                *state.stats.suppressed.entry(job.event.kind).or_insert(0) += 1;
                info!(
                    target: "roomguard::audit",
                    job = job.sequence,
                    sequence = job.event.sequence,
                    kind = %job.event.kind,
                    "Alert dropped, kind sent within cooldown"
                );
                record(
                    &mut state,
                    job,
                    JobStatus::Dropped,
                    Some(DropReason::Cooldown),
                    history_size,
                );
                return;
            }
        }

        let email = match inner
            .packager
            .package(&job.event, &job.bundle, &job.recipients)
            .await
        {
            Ok(packaged) => {
                if let Some(path) = packaged.archive_path {
                    job.lease.add(path);
                }
                packaged.email
            }
            Err(e) => {
                warn!(
                    job = job.sequence,
                    error = %e,
                    "Failed to package frames, sending alert without attachment"
                );
                inner.packager.text_only(&job.event, &job.bundle, &job.recipients)
            }
        };

        let outcome = self.deliver(&mut job, &email).await;

        let mut state = inner.state.lock();
        state.stats.attempts += u64::from(job.attempts);
        match outcome {
            Delivery::Sent => {
                state.last_sent.insert(job.event.kind, Instant::now());
                state.stats.sent += 1;
                info!(
                    target: "roomguard::audit",
                    job = job.sequence,
                    sequence = job.event.sequence,
                    kind = %job.event.kind,
                    attempts = job.attempts,
                    "Alert sent"
                );
                record(&mut state, job, JobStatus::Sent, None, history_size);
            }
            Delivery::Exhausted(e) => {
                state.stats.exhausted += 1;
                error!(
                    target: "roomguard::audit",
                    job = job.sequence,
                    sequence = job.event.sequence,
                    kind = %job.event.kind,
                    attempts = job.attempts,
                    error = %e,
                    "Alert delivery exhausted"
                );
                record(&mut state, job, JobStatus::Exhausted, None, history_size);
            }
            Delivery::Cancelled => {
                state.stats.dropped_on_shutdown += 1;
                error!(
                    target: "roomguard::audit",
                    job = job.sequence,
                    sequence = job.event.sequence,
                    kind = %job.event.kind,
                    attempts = job.attempts,
                    "Alert dropped on shutdown during delivery"
                );
                record(
                    &mut state,
                    job,
                    JobStatus::Dropped,
                    Some(DropReason::Shutdown),
                    history_size,
                );
            }
        }
    }

    async fn deliver(&self, job: &mut AlertJob, email: &OutgoingEmail) -> Delivery {
        let inner = &self.inner;
        let settings = &inner.settings;
        let mut backoff = settings.backoff();

        loop {
            job.attempts += 1;

            let attempt =
                tokio::time::timeout(settings.attempt_timeout, inner.transport.send(email));
            let result = tokio::select! {
                _ = inner.cancel.cancelled() => return Delivery::Cancelled,
                result = attempt => {
                    result.unwrap_or(Err(TransportError::Timeout(settings.attempt_timeout)))
                }
            };

            let err = match result {
                Ok(()) => return Delivery::Sent,
                Err(e) => e,
            };

            if job.attempts >= settings.max_attempts {
                return Delivery::Exhausted(err);
            }

            let delay = backoff.next_backoff().unwrap_or(settings.max_backoff);
            warn!(
                job = job.sequence,
                attempt = job.attempts,
                max_attempts = settings.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Alert delivery failed, retrying"
            );

            tokio::select! {
                _ = inner.cancel.cancelled() => return Delivery::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Best-effort single delivery that bypasses the queue and cooldown.
    pub async fn notify_operator(&self, subject: &str, body: &str) -> Result<(), TransportError> {
        let inner = &self.inner;
        let email = OutgoingEmail {
            subject: format!("[NOTICE] RoomGuard - {}", subject),
            body: body.to_string(),
            attachment: None,
            recipients: inner.settings.recipients.clone(),
        };

        let timeout = inner.settings.attempt_timeout;
        let result = tokio::time::timeout(timeout, inner.transport.send(&email))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)));

        let mut state = inner.state.lock();
        match &result {
            Ok(()) => {
                state.stats.notices_sent += 1;
                info!(target: "roomguard::audit", subject = %subject, "Operator notice sent");
            }
            Err(e) => {
                state.stats.notices_failed += 1;
                error!(subject = %subject, error = %e, "Failed to send operator notice");
            }
        }
        result
    }

    /// Stop admitting new events.
    pub fn close(&self) {
        if self.inner.accepting.swap(false, Ordering::SeqCst) {
            info!("Alert dispatcher closed to new events");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Close admission, give pending jobs `grace` to drain, then stop the
    /// worker and record whatever is left as dropped on shutdown.
    pub async fn shutdown(&self, worker: JoinHandle<()>, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        self.close();

        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        if !drained {
            warn!(
                grace_secs = grace.as_secs(),
                pending = self.pending_len(),
                "Alert queue not drained within grace period"
            );
        }

        inner.cancel.cancel();
        if let Err(e) = worker.await {
            error!(error = %e, "Alert dispatcher worker failed");
        }

        let mut state = inner.state.lock();
        let leftover: Vec<AlertJob> = state.pending.drain(..).collect();
        let dropped = leftover.len();
        for job in leftover {
            state.stats.dropped_on_shutdown += 1;
            error!(
                target: "roomguard::audit",
                job = job.sequence,
                sequence = job.event.sequence,
                kind = %job.event.kind,
                "Alert dropped on shutdown"
            );
            record(
                &mut state,
                job,
                JobStatus::Dropped,
                Some(DropReason::Shutdown),
                inner.settings.history_size,
            );
        }

        info!(
            drained,
            dropped_on_shutdown = dropped,
            sent = state.stats.sent,
            "Alert dispatcher shut down"
        );

        ShutdownReport {
            drained,
            dropped_on_shutdown: dropped,
            stats: state.stats.clone(),
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.state.lock().stats.clone()
    }

    /// Most recent terminal outcomes, oldest first.
    pub fn history(&self) -> Vec<JobRecord> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

/// Move a finished job into the history. Dropping the job releases its pins.
fn record(
    state: &mut DispatchState,
    mut job: AlertJob,
    status: JobStatus,
    drop_reason: Option<DropReason>,
    history_size: usize,
) {
    job.status = status;
    if history_size == 0 {
        return;
    }
    while state.history.len() >= history_size {
        state.history.pop_front();
    }
    state.history.push_back(JobRecord {
        job_sequence: job.sequence,
        event_sequence: job.event.sequence,
        kind: job.event.kind,
        channel_id: job.event.channel_id.clone(),
        status,
        drop_reason,
        attempts: job.attempts,
        enqueued_at: job.enqueued_at,
        finished_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_buffer::{Frame, FrameRingBuffer};
    use crate::sensor::Reading;
    use async_trait::async_trait;
    use std::path::PathBuf;

    /// Transport that replays a script of outcomes, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<bool>>,
        always_fail: bool,
        hang: bool,
        sent: Mutex<Vec<OutgoingEmail>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                always_fail: true,
                ..Self::default()
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                hang: true,
                ..Self::default()
            })
        }

        fn scripted(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.iter().copied().collect()),
                ..Self::default()
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl EmailTransport for ScriptedTransport {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
            *self.calls.lock() += 1;
            if self.hang {
                std::future::pending::<()>().await;
            }
            let ok = !self.always_fail && self.script.lock().pop_front().unwrap_or(true);
            if ok {
                self.sent.lock().push(email.clone());
                Ok(())
            } else {
                Err(TransportError::Rejected("scripted failure".to_string()))
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            cooldowns: SensorKind::ALL
                .iter()
                .map(|k| (*k, Duration::from_secs(300)))
                .collect(),
            queue_capacity: 10,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_jitter: 0.0,
            attempt_timeout: Duration::from_secs(5),
            history_size: 100,
            recipients: vec!["ops@example.org".to_string()],
        }
    }

    fn dispatcher_with(
        settings: DispatcherSettings,
        transport: Arc<dyn EmailTransport>,
    ) -> (AlertDispatcher, PinRegistry) {
        let pins = PinRegistry::new();
        let dispatcher = AlertDispatcher::new(
            settings,
            transport,
            AlertPackager::new("Test Room", false, None),
            pins.clone(),
        );
        (dispatcher, pins)
    }

    fn event(sequence: u64, kind: SensorKind) -> Event {
        Event {
            sequence,
            channel_id: format!("{}-1", kind),
            kind,
            confirmed_at: Utc::now(),
            reading: Reading::Digital(true),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_second_event_within_window() {
        let transport = ScriptedTransport::ok();
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());
        let worker = dispatcher.spawn();

        assert_eq!(
            dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty()),
            Admission::Admitted
        );
        wait_until(|| dispatcher.stats().sent == 1).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            dispatcher.enqueue(event(2, SensorKind::Flame), FrameBundle::empty()),
            Admission::Suppressed
        );

        let report = dispatcher.shutdown(worker, Duration::from_secs(1)).await;
        assert_eq!(report.stats.sent, 1);
        assert_eq!(report.stats.suppressed_for(SensorKind::Flame), 1);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let transport = ScriptedTransport::ok();
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Smoke), FrameBundle::empty());
        wait_until(|| dispatcher.stats().sent == 1).await;

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(
            dispatcher.enqueue(event(2, SensorKind::Smoke), FrameBundle::empty()),
            Admission::Admitted
        );
        wait_until(|| dispatcher.stats().sent == 2).await;

        dispatcher.shutdown(worker, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_per_kind() {
        let (dispatcher, _) = dispatcher_with(settings(), ScriptedTransport::ok());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty());
        wait_until(|| dispatcher.stats().sent == 1).await;

        assert_eq!(
            dispatcher.enqueue(event(2, SensorKind::Water), FrameBundle::empty()),
            Admission::Admitted
        );
        wait_until(|| dispatcher.stats().sent == 2).await;

        dispatcher.shutdown(worker, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest() {
        let (dispatcher, _) = dispatcher_with(settings(), ScriptedTransport::failing());

        let admissions: Vec<Admission> = (1..=15)
            .map(|seq| {
                dispatcher.enqueue(event(seq, SensorKind::Temperature), FrameBundle::empty())
            })
            .collect();

        assert!(admissions[..10].iter().all(|a| *a == Admission::Admitted));
        let dropped: Vec<u64> = admissions[10..]
            .iter()
            .map(|a| match a {
                Admission::AdmittedWithDisplacement { dropped_sequence } => *dropped_sequence,
                other => panic!("unexpected admission {:?}", other),
            })
            .collect();
        assert_eq!(dropped, vec![1, 2, 3, 4, 5]);

        assert_eq!(dispatcher.pending_len(), 10);
        let stats = dispatcher.stats();
        assert_eq!(stats.displaced, 5);
        assert_eq!(stats.admitted, 15);

        let history = dispatcher.history();
        assert_eq!(history.len(), 5);
        assert!(history.iter().all(|r| {
            r.status == JobStatus::Dropped && r.drop_reason == Some(DropReason::Displaced)
        }));
        assert_eq!(
            history.iter().map(|r| r.event_sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let transport = ScriptedTransport::scripted(&[false, false, true]);
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty());
        wait_until(|| dispatcher.stats().sent == 1).await;

        let history = dispatcher.history();
        assert_eq!(history[0].status, JobStatus::Sent);
        assert_eq!(history[0].attempts, 3);
        assert_eq!(*transport.calls.lock(), 3);

        dispatcher.shutdown(worker, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_job_does_not_start_cooldown() {
        let transport = ScriptedTransport::failing();
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty());
        wait_until(|| dispatcher.stats().exhausted == 1).await;

        let history = dispatcher.history();
        assert_eq!(history[0].status, JobStatus::Exhausted);
        assert_eq!(history[0].attempts, 3);
        assert_eq!(*transport.calls.lock(), 3);

        assert_eq!(
            dispatcher.enqueue(event(2, SensorKind::Flame), FrameBundle::empty()),
            Admission::Admitted
        );

        dispatcher.shutdown(worker, Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let mut settings = settings();
        settings.max_attempts = 2;
        let transport = ScriptedTransport::hanging();
        let (dispatcher, _) = dispatcher_with(settings, transport.clone());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Water), FrameBundle::empty());
        wait_until(|| dispatcher.stats().exhausted == 1).await;

        assert_eq!(dispatcher.history()[0].attempts, 2);
        assert_eq!(dispatcher.stats().attempts, 2);

        dispatcher.shutdown(worker, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_rechecked_at_dispatch() {
        let transport = ScriptedTransport::ok();
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());

        assert_eq!(
            dispatcher.enqueue(event(1, SensorKind::Smoke), FrameBundle::empty()),
            Admission::Admitted
        );
        assert_eq!(
            dispatcher.enqueue(event(2, SensorKind::Smoke), FrameBundle::empty()),
            Admission::Admitted
        );

        let worker = dispatcher.spawn();
        let report = dispatcher.shutdown(worker, Duration::from_secs(5)).await;

        assert!(report.drained);
        assert_eq!(report.stats.sent, 1);
        assert_eq!(report.stats.suppressed_for(SensorKind::Smoke), 1);
        assert_eq!(transport.sent_count(), 1);

        let history = dispatcher.history();
        assert_eq!(history[1].drop_reason, Some(DropReason::Cooldown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_pending_jobs() {
        let transport = ScriptedTransport::ok();
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty());
        dispatcher.enqueue(event(2, SensorKind::Water), FrameBundle::empty());

        let report = dispatcher.shutdown(worker, Duration::from_secs(5)).await;
        assert!(report.drained);
        assert_eq!(report.dropped_on_shutdown, 0);
        assert_eq!(report.stats.sent, 2);

        assert_eq!(
            dispatcher.enqueue(event(3, SensorKind::Smoke), FrameBundle::empty()),
            Admission::Closed
        );
        assert_eq!(dispatcher.stats().rejected_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_records_leftover_jobs() {
        let mut settings = settings();
        settings.initial_backoff = Duration::from_secs(60);
        settings.max_backoff = Duration::from_secs(60);
        let (dispatcher, _) = dispatcher_with(settings, ScriptedTransport::failing());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty());
        dispatcher.enqueue(event(2, SensorKind::Water), FrameBundle::empty());
        dispatcher.enqueue(event(3, SensorKind::Smoke), FrameBundle::empty());

        let report = dispatcher.shutdown(worker, Duration::from_secs(1)).await;
        assert!(!report.drained);
        assert_eq!(report.dropped_on_shutdown, 2);
        // The job in its backoff sleep is dropped too
        assert_eq!(report.stats.dropped_on_shutdown, 3);

        let history = dispatcher.history();
        assert_eq!(history.len(), 3);
        assert!(history
            .iter()
            .all(|r| r.drop_reason == Some(DropReason::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_unpinned_after_terminal_status() {
        let (dispatcher, pins) = dispatcher_with(settings(), ScriptedTransport::ok());

        let mut buffer = FrameRingBuffer::new(5);
        for i in 1..=3 {
            let mut frame = Frame::new(i, Utc::now(), vec![i as u8]);
            frame.path = Some(PathBuf::from(format!("/data/frames/frame_{}.jpg", i)));
            buffer.push(frame);
        }

        dispatcher.enqueue(event(1, SensorKind::Flame), buffer.snapshot());
        assert_eq!(pins.len(), 3);
        assert!(pins.is_pinned(&PathBuf::from("/data/frames/frame_2.jpg")));

        let worker = dispatcher.spawn();
        wait_until(|| dispatcher.stats().sent == 1).await;
        assert!(pins.is_empty());

        dispatcher.shutdown(worker, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_notice_bypasses_cooldown() {
        let transport = ScriptedTransport::ok();
        let (dispatcher, _) = dispatcher_with(settings(), transport.clone());
        let worker = dispatcher.spawn();

        dispatcher.enqueue(event(1, SensorKind::Flame), FrameBundle::empty());
        wait_until(|| dispatcher.stats().sent == 1).await;

        dispatcher
            .notify_operator("channel flame-1 degraded", "5 consecutive read failures")
            .await
            .unwrap();

        assert_eq!(transport.sent_count(), 2);
        let notice = transport.sent.lock()[1].clone();
        assert_eq!(notice.subject, "[NOTICE] RoomGuard - channel flame-1 degraded");
        assert_eq!(dispatcher.stats().notices_sent, 1);

        dispatcher.shutdown(worker, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut settings = settings();
        settings.queue_capacity = 1;
        settings.history_size = 3;
        let (dispatcher, _) = dispatcher_with(settings, ScriptedTransport::failing());

        for seq in 1..=10 {
            dispatcher.enqueue(event(seq, SensorKind::Humidity), FrameBundle::empty());
        }

        let history = dispatcher.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event_sequence, 7);
        assert_eq!(history[2].event_sequence, 9);
    }
}
