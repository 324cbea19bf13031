//! Service assembly: wires the process-lifetime components around the
//! supervised monitor and tears them down in order.

use crate::config::MonitorConfig;
use crate::dispatcher::DispatchStats;
use crate::health::{HealthLimits, ProcessSampler};
use crate::monitor::{Monitor, MonitorContext};
use crate::reaper::{ReaperSettings, StorageReaper};
use crate::supervisor::{
    RestartPolicy, Supervisor, SupervisorExit, SupervisorHandle, SupervisorState,
};
use crate::transport::{self, EmailTransport};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the service ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    Shutdown,
    Failed,
}

impl ServiceExit {
    /// Process exit code: 0 after a requested shutdown, 2 after the restart
    /// budget ran out. Startup errors exit with 1 before a service exists.
    pub fn code(self) -> u8 {
        match self {
            Self::Shutdown => 0,
            Self::Failed => 2,
        }
    }
}

/// Liveness snapshot written for external process managers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub service: &'static str,
    pub version: &'static str,
    pub pid: u32,
    pub state: SupervisorState,
    pub restarts: u32,
    pub pending_alerts: usize,
    pub pinned_paths: usize,
    pub buffered_frames: usize,
    pub last_event_sequence: u64,
    pub dispatch: DispatchStats,
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    fn collect(handle: &SupervisorHandle, ctx: &MonitorContext) -> Self {
        Self {
            service: "roomguard-monitor",
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
            state: handle.state(),
            restarts: handle.restarts(),
            pending_alerts: ctx.dispatcher.pending_len(),
            pinned_paths: ctx.pins.len(),
            buffered_frames: ctx.frames.read().len(),
            last_event_sequence: ctx.sequence.current(),
            dispatch: ctx.dispatcher.stats(),
            updated_at: Utc::now(),
        }
    }
}

/// Atomically replace the status file.
pub async fn write_status(path: &Path, report: &StatusReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_vec_pretty(report)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// The assembled monitor service.
pub struct Service {
    ctx: MonitorContext,
}

impl Service {
    /// Build the service with the transport selected in configuration.
    pub fn new(config: MonitorConfig) -> anyhow::Result<Self> {
        let transport = transport::from_config(&config.email)
            .context("Failed to set up email transport")?;
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: MonitorConfig, transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            ctx: MonitorContext::new(Arc::new(config), transport),
        }
    }

    pub fn context(&self) -> &MonitorContext {
        &self.ctx
    }

    /// Run until `shutdown` is cancelled or the restart budget is exhausted.
    pub async fn run(self, shutdown: CancellationToken) -> ServiceExit {
        let ctx = self.ctx;
        let config = ctx.config.clone();

        if let Some(log_file) = &config.logging.file {
            // The active log file is never reclaimed
            ctx.pins.pin(log_file.clone());
        }

        let worker = ctx.dispatcher.spawn();
        let background = CancellationToken::new();

        let reaper = Arc::new(StorageReaper::new(
            ReaperSettings::from_config(&config.storage),
            ctx.pins.clone(),
        ));
        let reaper_task = tokio::spawn(
            reaper.run(config.storage.sweep_interval(), background.child_token()),
        );

        let supervisor = Supervisor::new(
            RestartPolicy::from_config(&config.watchdog),
            HealthLimits::from_config(&config.watchdog),
            ProcessSampler::new(),
            shutdown.clone(),
        );
        let handle = supervisor.handle();

        let status_task = config.watchdog.status_file.clone().map(|path| {
            tokio::spawn(status_loop(
                path,
                config.watchdog.health_interval(),
                handle.clone(),
                ctx.clone(),
                background.child_token(),
            ))
        });

        info!(
            channels = config.sensors.channels.len(),
            camera = config.camera.enabled,
            recipients = config.email.recipients.len(),
            "Service started"
        );

        let monitor_ctx = ctx.clone();
        let exit = supervisor
            .run(move |token| {
                let ctx = monitor_ctx.clone();
                async move { Monitor::from_config(ctx)?.run(token).await }
            })
            .await;

        ctx.dispatcher.close();

        let service_exit = match exit {
            SupervisorExit::Shutdown => {
                info!("Shutdown requested, draining alerts");
                ServiceExit::Shutdown
            }
            SupervisorExit::Failed { exits, last_error } => {
                error!(exits, last_error = %last_error, "Monitor failed permanently");
                let body = format!(
                    "The RoomGuard monitor exited {} times within {} seconds and will not be \
                     restarted automatically.\n\nLast error: {}\n\n\
                     Manual intervention is required.\n",
                    exits, config.watchdog.restart_window_secs, last_error
                );
                let _ = ctx
                    .dispatcher
                    .notify_operator("monitor failed, restart budget exhausted", &body)
                    .await;
                ServiceExit::Failed
            }
        };

        let report = ctx
            .dispatcher
            .shutdown(worker, config.alerts.shutdown_grace())
            .await;

        background.cancel();
        if let Err(e) = reaper_task.await {
            warn!(error = %e, "Storage reaper task failed");
        }
        if let Some(task) = status_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Status writer task failed");
            }
        }

        if let Some(path) = &config.watchdog.status_file {
            if let Err(e) = write_status(path, &StatusReport::collect(&handle, &ctx)).await {
                warn!(path = %path.display(), error = %e, "Failed to write final status");
            }
        }

        info!(
            sent = report.stats.sent,
            exhausted = report.stats.exhausted,
            suppressed = report.stats.suppressed_total(),
            dropped_on_shutdown = report.stats.dropped_on_shutdown,
            exit_code = service_exit.code(),
            "Service stopped"
        );

        service_exit
    }
}

async fn status_loop(
    path: std::path::PathBuf,
    interval: Duration,
    handle: SupervisorHandle,
    ctx: MonitorContext,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut states = handle.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let report = StatusReport::collect(&handle, &ctx);
        match write_status(&path, &report).await {
            Ok(()) => debug!(path = %path.display(), state = ?report.state, "Status written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write status"),
        }
    }
}
