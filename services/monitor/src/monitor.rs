//! The sensing side of the service.
//!
//! [`MonitorContext`] is built once per process and owns everything that must
//! survive a restart: configuration, the frame buffer, the dispatcher, the
//! event sequence and the pin registry. A [`Monitor`] is one supervised
//! incarnation: it opens the sensor channels, runs the capture loop and polls
//! the channels until cancelled.

use crate::capture::{CaptureLoop, CommandCapture};
use crate::config::MonitorConfig;
use crate::debounce::{ChannelState, ChannelStatus, DebounceEngine, Event, SequenceGenerator};
use crate::dispatcher::{Admission, AlertDispatcher, DispatcherSettings};
use crate::frame_buffer::{self, SharedFrameBuffer};
use crate::packaging::AlertPackager;
use crate::reaper::PinRegistry;
use crate::sensor::{ChannelSpec, FileSensorReader, SensorReader};
use crate::transport::EmailTransport;
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-lifetime state shared by every monitor incarnation.
#[derive(Clone)]
pub struct MonitorContext {
    pub config: Arc<MonitorConfig>,
    pub frames: SharedFrameBuffer,
    pub dispatcher: AlertDispatcher,
    pub sequence: Arc<SequenceGenerator>,
    /// Frame numbering shared by every capture loop
    pub frame_sequence: Arc<SequenceGenerator>,
    pub pins: PinRegistry,
}

impl MonitorContext {
    pub fn new(config: Arc<MonitorConfig>, transport: Arc<dyn EmailTransport>) -> Self {
        let pins = PinRegistry::new();
        let packager = AlertPackager::new(
            config.alerts.location.clone(),
            config.alerts.include_images,
            Some(config.storage.archives_dir()),
        );
        let dispatcher = AlertDispatcher::new(
            DispatcherSettings::from_config(&config),
            transport,
            packager,
            pins.clone(),
        );

        Self {
            frames: frame_buffer::shared(config.camera.buffer_capacity),
            dispatcher,
            sequence: Arc::new(SequenceGenerator::new()),
            frame_sequence: Arc::new(SequenceGenerator::new()),
            pins,
            config,
        }
    }
}

/// One monitor incarnation.
pub struct Monitor {
    ctx: MonitorContext,
    engine: DebounceEngine,
    specs: Vec<ChannelSpec>,
    reader: Box<dyn SensorReader>,
    capture: Option<CaptureLoop>,
}

impl Monitor {
    pub fn new(
        ctx: MonitorContext,
        reader: Box<dyn SensorReader>,
        capture: Option<CaptureLoop>,
    ) -> anyhow::Result<Self> {
        let specs = ctx
            .config
            .sensors
            .channel_specs()
            .context("Invalid sensor channel configuration")?;
        let engine = DebounceEngine::new(
            specs.clone(),
            ctx.config.sensors.degrade_after_failures,
            ctx.sequence.clone(),
        );

        Ok(Self {
            ctx,
            engine,
            specs,
            reader,
            capture,
        })
    }

    /// Open the configured file-backed channels and camera.
    pub fn from_config(ctx: MonitorContext) -> anyhow::Result<Self> {
        let specs = ctx.config.sensors.channel_specs()?;
        let reader = FileSensorReader::open(&specs).context("Failed to open sensor channels")?;

        let camera = &ctx.config.camera;
        let capture = camera.enabled.then(|| {
            CaptureLoop::new(
                Arc::new(CommandCapture::new(camera)),
                ctx.frames.clone(),
                camera.capture_interval(),
                camera.persist_frames.then(|| ctx.config.storage.frames_dir()),
            )
            .with_sequence(ctx.frame_sequence.clone())
        });

        Self::new(ctx, Box::new(reader), capture)
    }

    pub fn channel_statuses(&self) -> Vec<ChannelStatus> {
        self.engine.statuses()
    }

    /// Read every channel once and hand confirmed events to the dispatcher.
    pub fn poll_once(&mut self) -> Vec<Event> {
        let mut events = Vec::new();

        for spec in &self.specs {
            let before = self.engine.state(&spec.id);
            let result = self.reader.read(spec);
            let event = self.engine.observe(&spec.id, result);

            if before != Some(ChannelState::Degraded)
                && self.engine.state(&spec.id) == Some(ChannelState::Degraded)
            {
                self.notify_degraded(spec);
            }

            if let Some(event) = event {
                let bundle = self.ctx.frames.read().snapshot();
                let frames = bundle.len();
                match self.ctx.dispatcher.enqueue(event.clone(), bundle) {
                    Admission::Admitted | Admission::AdmittedWithDisplacement { .. } => {
                        info!(
                            sequence = event.sequence,
                            channel = %event.channel_id,
                            kind = %event.kind,
                            frames,
                            "Alert queued"
                        );
                    }
                    Admission::Suppressed => {
                        debug!(sequence = event.sequence, "Alert suppressed by cooldown");
                    }
                    Admission::Closed => {}
                }
                events.push(event);
            }
        }

        events
    }

    fn notify_degraded(&self, spec: &ChannelSpec) {
        let failures = self
            .engine
            .channel(&spec.id)
            .map(|c| c.failures())
            .unwrap_or_default();
        let subject = format!("sensor channel {} degraded", spec.id);
        let body = format!(
            "Channel {} ({}) failed {} consecutive reads from {} and is excluded from \
             triggering until it reads successfully again.\n",
            spec.id,
            spec.kind,
            failures,
            spec.source.display()
        );

        let dispatcher = self.ctx.dispatcher.clone();
        tokio::spawn(async move {
            let _ = dispatcher.notify_operator(&subject, &body).await;
        });
    }

    /// Poll until cancelled, running the capture loop alongside.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let capture_task = self.capture.take().map(|capture| {
            let token = cancel.child_token();
            tokio::spawn(async move { capture.run(token).await })
        });

        let interval = self.ctx.config.sensors.poll_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            channels = self.specs.len(),
            poll_interval_ms = interval.as_millis() as u64,
            camera = capture_task.is_some(),
            "Monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once();
                }
            }
        }

        if let Some(task) = capture_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Capture task failed");
            }
        }

        info!("Monitor stopped");
        Ok(())
    }
}
