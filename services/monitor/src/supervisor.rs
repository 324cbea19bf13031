//! Bounded-restart supervision of monitor incarnations.
//!
//! The supervisor launches one monitor incarnation at a time and restarts it
//! after unplanned exits with doubling backoff. Sustained resource breaches
//! stop the incarnation on purpose; that restart counts against the same
//! budget. Once more exits than the budget allows fall inside the sliding
//! window the supervisor gives up and reports [`SupervisorState::Failed`].

use crate::config::WatchdogConfig;
use crate::health::{HealthLimits, HealthMonitor, HealthSampler, HealthVerdict};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state published by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Restarting,
    Failed,
    Stopped,
}

/// How the supervisor finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested
    Shutdown,
    /// Restart budget exhausted
    Failed { exits: usize, last_error: String },
}

/// Restart budget and timing.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub health_interval: Duration,
    pub stop_grace: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window(),
            backoff_base: config.restart_backoff_base(),
            backoff_max: config.restart_backoff_max(),
            health_interval: config.health_interval(),
            stop_grace: config.stop_grace(),
        }
    }

    /// Delay before the `n`th restart in the window (1-based).
    pub fn backoff_for(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32, delay: Duration },
    GiveUp { exits: usize },
}

/// Sliding-window count of unplanned exits.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    exits: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            exits: VecDeque::new(),
        }
    }

    /// Exits still inside the window at `now`.
    pub fn exits_in_window(&mut self, now: Instant) -> usize {
        while let Some(first) = self.exits.front() {
            if now.saturating_duration_since(*first) >= self.policy.window {
                self.exits.pop_front();
            } else {
                break;
            }
        }
        self.exits.len()
    }

    pub fn record_exit(&mut self, now: Instant) -> RestartDecision {
        self.exits.push_back(now);
        let exits = self.exits_in_window(now);

        if exits > self.policy.max_restarts as usize {
            RestartDecision::GiveUp { exits }
        } else {
            let attempt = exits as u32;
            RestartDecision::Restart {
                attempt,
                delay: self.policy.backoff_for(attempt),
            }
        }
    }
}

/// Observer side of a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    state: watch::Receiver<SupervisorState>,
    shutdown: CancellationToken,
    restarts: Arc<AtomicU32>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}

enum IncarnationEnd {
    Shutdown,
    Exited(String),
    Unhealthy(String),
}

/// Keeps monitor incarnations running within the restart budget.
pub struct Supervisor<S> {
    policy: RestartPolicy,
    limits: HealthLimits,
    sampler: S,
    state: watch::Sender<SupervisorState>,
    shutdown: CancellationToken,
    restarts: Arc<AtomicU32>,
}

impl<S: HealthSampler> Supervisor<S> {
    pub fn new(
        policy: RestartPolicy,
        limits: HealthLimits,
        sampler: S,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            policy,
            limits,
            sampler,
            state,
            shutdown,
            restarts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            state: self.state.subscribe(),
            shutdown: self.shutdown.clone(),
            restarts: self.restarts.clone(),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Supervisor state changed");
        }
    }

    /// Run incarnations produced by `launch` until shutdown or failure.
    ///
    /// Each incarnation receives its own cancellation token. An incarnation
    /// returning while no shutdown was requested counts as an unplanned exit,
    /// whether it returned `Ok` or `Err`.
    pub async fn run<F, Fut>(mut self, mut launch: F) -> SupervisorExit
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut tracker = RestartTracker::new(self.policy.clone());
        let mut health = HealthMonitor::new(self.limits);

        info!(
            max_restarts = self.policy.max_restarts,
            window_secs = self.policy.window.as_secs(),
            "Supervisor started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(SupervisorState::Stopped);
                return SupervisorExit::Shutdown;
            }

            let token = self.shutdown.child_token();
            let mut task = tokio::spawn(launch(token.clone()));
            self.set_state(SupervisorState::Running);
            health.reset();

            let end = self.watch_incarnation(&mut task, &token, &mut health).await;

            let reason = match end {
                IncarnationEnd::Shutdown => {
                    self.set_state(SupervisorState::Stopped);
                    return SupervisorExit::Shutdown;
                }
                IncarnationEnd::Exited(reason) => {
                    error!(reason = %reason, "Monitor exited unexpectedly");
                    reason
                }
                IncarnationEnd::Unhealthy(reason) => {
                    warn!(reason = %reason, "Restarting unhealthy monitor");
                    reason
                }
            };

            match tracker.record_exit(Instant::now()) {
                RestartDecision::GiveUp { exits } => {
                    self.set_state(SupervisorState::Failed);
                    error!(
                        exits,
                        max_restarts = self.policy.max_restarts,
                        window_secs = self.policy.window.as_secs(),
                        last_error = %reason,
                        "Restart budget exhausted, giving up"
                    );
                    return SupervisorExit::Failed {
                        exits,
                        last_error: reason,
                    };
                }
                RestartDecision::Restart { attempt, delay } => {
                    self.set_state(SupervisorState::Restarting);
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        attempt,
                        max_restarts = self.policy.max_restarts,
                        delay_ms = delay.as_millis() as u64,
                        "Restarting monitor"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            self.set_state(SupervisorState::Stopped);
                            return SupervisorExit::Shutdown;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn watch_incarnation(
        &mut self,
        task: &mut JoinHandle<anyhow::Result<()>>,
        token: &CancellationToken,
        health: &mut HealthMonitor,
    ) -> IncarnationEnd {
        let interval = self.policy.health_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    stop_incarnation(task, token, self.policy.stop_grace).await;
                    return IncarnationEnd::Shutdown;
                }
                result = &mut *task => {
                    if self.shutdown.is_cancelled() {
                        return IncarnationEnd::Shutdown;
                    }
                    return IncarnationEnd::Exited(match result {
                        Ok(Ok(())) => "monitor returned without a shutdown request".to_string(),
                        Ok(Err(e)) => format!("{:#}", e),
                        Err(e) => format!("monitor task failed: {}", e),
                    });
                }
                _ = ticker.tick() => {
                    let Some(sample) = self.sampler.sample() else {
                        continue;
                    };
                    match health.observe(sample) {
                        HealthVerdict::Healthy => {}
                        HealthVerdict::Breaching { consecutive, reason } => {
                            warn!(
                                consecutive,
                                required = self.limits.breach_samples,
                                reason = %reason,
                                "Resource limit breached"
                            );
                        }
                        HealthVerdict::Unhealthy { reason } => {
                            stop_incarnation(task, token, self.policy.stop_grace).await;
                            return IncarnationEnd::Unhealthy(reason);
                        }
                    }
                }
            }
        }
    }
}

async fn stop_incarnation(
    task: &mut JoinHandle<anyhow::Result<()>>,
    token: &CancellationToken,
    grace: Duration,
) {
    token.cancel();
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Monitor returned an error while stopping"),
        Ok(Err(e)) => warn!(error = %e, "Monitor task failed while stopping"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "Monitor did not stop in time, aborting");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthSample;
    use std::sync::atomic::AtomicUsize;

    struct FixedSampler(Option<HealthSample>);

    impl HealthSampler for FixedSampler {
        fn sample(&mut self) -> Option<HealthSample> {
            self.0
        }
    }

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            window: Duration::from_secs(3600),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            health_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(1),
        }
    }

    fn limits() -> HealthLimits {
        HealthLimits {
            max_memory_bytes: 512 * 1024 * 1024,
            max_cpu_percent: 90.0,
            breach_samples: 2,
        }
    }

    fn quiet() -> FixedSampler {
        FixedSampler(Some(HealthSample {
            memory_bytes: 1024,
            cpu_percent: 1.0,
        }))
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = policy(10);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(6), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_exit_in_window_gives_up() {
        let mut tracker = RestartTracker::new(policy(10));
        for i in 1..=10 {
            assert!(matches!(
                tracker.record_exit(Instant::now()),
                RestartDecision::Restart { attempt, .. } if attempt == i
            ));
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        assert_eq!(
            tracker.record_exit(Instant::now()),
            RestartDecision::GiveUp { exits: 11 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_exits_leave_the_window() {
        let mut tracker = RestartTracker::new(policy(2));
        tracker.record_exit(Instant::now());
        tracker.record_exit(Instant::now());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(matches!(
            tracker.record_exit(Instant::now()),
            RestartDecision::Restart { attempt: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_fails_after_budget() {
        let launches = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(policy(10), limits(), quiet(), CancellationToken::new());
        let handle = supervisor.handle();

        let counter = launches.clone();
        let exit = supervisor
            .run(move |_token| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("sensor bus missing")) }
            })
            .await;

        assert_eq!(
            exit,
            SupervisorExit::Failed {
                exits: 11,
                last_error: "sensor bus missing".to_string()
            }
        );
        assert_eq!(launches.load(Ordering::SeqCst), 11);
        assert_eq!(handle.restarts(), 10);
        assert_eq!(handle.state(), SupervisorState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_stops_incarnation() {
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(policy(3), limits(), quiet(), shutdown.clone());
        let handle = supervisor.handle();
        let stopped = Arc::new(AtomicUsize::new(0));

        let flag = stopped.clone();
        let run = tokio::spawn(supervisor.run(move |token| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        }));

        let mut states = handle.subscribe();
        states
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        handle.request_shutdown();
        assert_eq!(run.await.unwrap(), SupervisorExit::Shutdown);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), SupervisorState::Stopped);
        assert_eq!(handle.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_breach_forces_planned_restart() {
        let sampler = FixedSampler(Some(HealthSample {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_percent: 1.0,
        }));
        let supervisor = Supervisor::new(policy(1), limits(), sampler, CancellationToken::new());
        let handle = supervisor.handle();
        let launches = Arc::new(AtomicUsize::new(0));

        let counter = launches.clone();
        let exit = supervisor
            .run(move |token| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    token.cancelled().await;
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        assert!(matches!(
            exit,
            SupervisorExit::Failed { exits: 2, ref last_error } if last_error.starts_with("memory")
        ));
        assert_eq!(launches.load(Ordering::SeqCst), 2);
        assert_eq!(handle.restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_return_counts_as_unplanned_exit() {
        let supervisor = Supervisor::new(policy(1), limits(), quiet(), CancellationToken::new());
        let exit = supervisor.run(|_token| async { Ok::<(), anyhow::Error>(()) }).await;
        assert!(matches!(exit, SupervisorExit::Failed { exits: 2, .. }));
    }
}
