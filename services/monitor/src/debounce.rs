//! Per-channel debounce state machine.
//!
//! Raw reads become confirmed [`Event`]s only after a channel sees
//! `threshold` consecutive triggering reads. A single non-triggering read
//! resets the streak. Read failures never touch the streak; enough of them in
//! a row park the channel in [`ChannelState::Degraded`], where it cannot
//! trigger until a read succeeds again.

use crate::sensor::{ChannelSpec, Reading, SensorKind, SensorReadError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Candidate,
    Confirmed,
    Degraded,
}

/// Process-wide source of strictly increasing sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number, starting at 1.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last number handed out (0 if none).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// A confirmed hazardous condition on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub sequence: u64,
    pub channel_id: String,
    pub kind: SensorKind,
    pub confirmed_at: DateTime<Utc>,
    /// The reading that completed the streak
    pub reading: Reading,
}

/// Runtime state of a channel.
#[derive(Debug, Clone)]
pub struct SensorChannel {
    spec: ChannelSpec,
    consecutive: u32,
    failures: u32,
    state: ChannelState,
}

impl SensorChannel {
    pub fn new(spec: ChannelSpec) -> Self {
        Self {
            spec,
            consecutive: 0,
            failures: 0,
            state: ChannelState::Idle,
        }
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Snapshot of a channel for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub id: String,
    pub kind: SensorKind,
    pub state: ChannelState,
    pub consecutive: u32,
    pub threshold: u32,
    pub failures: u32,
}

/// Turns raw reads into confirmed events for a fixed set of channels.
pub struct DebounceEngine {
    channels: Vec<SensorChannel>,
    index: HashMap<String, usize>,
    degrade_after: u32,
    sequence: Arc<SequenceGenerator>,
}

impl DebounceEngine {
    /// Create an engine for the given channels.
    ///
    /// `degrade_after` is the number of consecutive read failures that
    /// degrades a channel.
    pub fn new(
        specs: Vec<ChannelSpec>,
        degrade_after: u32,
        sequence: Arc<SequenceGenerator>,
    ) -> Self {
        let channels: Vec<SensorChannel> = specs.into_iter().map(SensorChannel::new).collect();
        let index = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.spec.id.clone(), i))
            .collect();

        Self {
            channels,
            index,
            degrade_after: degrade_after.max(1),
            sequence,
        }
    }

    pub fn channel(&self, id: &str) -> Option<&SensorChannel> {
        self.index.get(id).map(|&i| &self.channels[i])
    }

    pub fn state(&self, id: &str) -> Option<ChannelState> {
        self.channel(id).map(SensorChannel::state)
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels
            .iter()
            .map(|c| ChannelStatus {
                id: c.spec.id.clone(),
                kind: c.spec.kind,
                state: c.state,
                consecutive: c.consecutive,
                threshold: c.spec.threshold,
                failures: c.failures,
            })
            .collect()
    }

    /// Feed one read result for a channel.
    ///
    /// Returns an event exactly when this read completes a streak of
    /// `threshold` consecutive triggering reads.
    pub fn observe(
        &mut self,
        channel_id: &str,
        reading: Result<Reading, SensorReadError>,
    ) -> Option<Event> {
        let Some(&idx) = self.index.get(channel_id) else {
            warn!(channel = %channel_id, "Reading for unknown channel ignored");
            return None;
        };
        let degrade_after = self.degrade_after;
        let channel = &mut self.channels[idx];

        let reading = match reading {
            Ok(reading) => reading,
            Err(e) => {
                channel.failures = channel.failures.saturating_add(1);
                debug!(
                    channel = %channel.spec.id,
                    failures = channel.failures,
                    error = %e,
                    "Sensor read failed"
                );

                if channel.failures >= degrade_after && channel.state != ChannelState::Degraded {
                    channel.state = ChannelState::Degraded;
                    channel.consecutive = 0;
                    error!(
                        channel = %channel.spec.id,
                        kind = %channel.spec.kind,
                        failures = channel.failures,
                        error = %e,
                        "Channel degraded after repeated read failures"
                    );
                }
                return None;
            }
        };

        if channel.state == ChannelState::Degraded {
            info!(
                channel = %channel.spec.id,
                failures = channel.failures,
                "Channel recovered"
            );
            channel.state = ChannelState::Idle;
        }
        channel.failures = 0;

        if !channel.spec.rule.is_triggering(&reading) {
            channel.consecutive = 0;
            channel.state = ChannelState::Idle;
            return None;
        }

        channel.consecutive += 1;
        if channel.consecutive < channel.spec.threshold {
            channel.state = ChannelState::Candidate;
            debug!(
                channel = %channel.spec.id,
                consecutive = channel.consecutive,
                threshold = channel.spec.threshold,
                "Triggering read"
            );
            return None;
        }

        channel.consecutive = 0;
        channel.state = ChannelState::Confirmed;

        let event = Event {
            sequence: self.sequence.next(),
            channel_id: channel.spec.id.clone(),
            kind: channel.spec.kind,
            confirmed_at: Utc::now(),
            reading,
        };

        info!(
            target: "roomguard::audit",
            sequence = event.sequence,
            channel = %event.channel_id,
            kind = %event.kind,
            reading = %event.reading,
            "Event confirmed"
        );

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::TriggerRule;
    use std::path::PathBuf;

    fn spec(id: &str, kind: SensorKind, threshold: u32) -> ChannelSpec {
        ChannelSpec {
            id: id.to_string(),
            kind,
            source: PathBuf::from("/dev/null"),
            active_low: false,
            scale: 1.0,
            threshold,
            rule: TriggerRule::Active,
        }
    }

    fn engine(specs: Vec<ChannelSpec>) -> DebounceEngine {
        DebounceEngine::new(specs, 3, Arc::new(SequenceGenerator::new()))
    }

    fn digital(bits: &[u8]) -> Vec<Reading> {
        bits.iter().map(|b| Reading::Digital(*b == 1)).collect()
    }

    fn read_error() -> SensorReadError {
        SensorReadError::Unavailable("test".to_string())
    }

    /// Returns the 1-based indexes of reads that produced an event.
    fn confirmations(engine: &mut DebounceEngine, id: &str, reads: &[Reading]) -> Vec<usize> {
        reads
            .iter()
            .enumerate()
            .filter_map(|(i, r)| engine.observe(id, Ok(*r)).map(|_| i + 1))
            .collect()
    }

    #[test]
    fn test_flame_confirms_on_fourth_read() {
        let mut engine = engine(vec![spec("flame-1", SensorKind::Flame, 3)]);
        let hits = confirmations(&mut engine, "flame-1", &digital(&[0, 1, 1, 1]));
        assert_eq!(hits, vec![4]);
        assert_eq!(engine.state("flame-1"), Some(ChannelState::Confirmed));
    }

    #[test]
    fn test_smoke_confirms_on_second_read() {
        let mut engine = engine(vec![spec("smoke-1", SensorKind::Smoke, 2)]);
        let hits = confirmations(&mut engine, "smoke-1", &digital(&[1, 1]));
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn test_negative_read_resets_streak() {
        let mut engine = engine(vec![spec("flame-1", SensorKind::Flame, 3)]);
        let hits = confirmations(&mut engine, "flame-1", &digital(&[1, 1, 0, 1, 1]));
        assert!(hits.is_empty());
        assert_eq!(engine.channel("flame-1").unwrap().consecutive(), 2);
        assert_eq!(engine.state("flame-1"), Some(ChannelState::Candidate));
    }

    #[test]
    fn test_sustained_signal_confirms_once_per_threshold() {
        let mut engine = engine(vec![spec("flame-1", SensorKind::Flame, 3)]);
        let hits = confirmations(&mut engine, "flame-1", &digital(&[1, 1, 1, 1, 1, 1, 1]));
        assert_eq!(hits, vec![3, 6]);
        assert_eq!(engine.channel("flame-1").unwrap().consecutive(), 1);
    }

    #[test]
    fn test_threshold_one_confirms_immediately() {
        let mut engine = engine(vec![spec("water-1", SensorKind::Water, 1)]);
        let hits = confirmations(&mut engine, "water-1", &digital(&[0, 1, 1]));
        assert_eq!(hits, vec![2, 3]);
    }

    #[test]
    fn test_read_failure_keeps_count() {
        let mut engine = engine(vec![spec("flame-1", SensorKind::Flame, 3)]);
        assert!(engine.observe("flame-1", Ok(Reading::Digital(true))).is_none());
        assert!(engine.observe("flame-1", Err(read_error())).is_none());
        assert!(engine.observe("flame-1", Ok(Reading::Digital(true))).is_none());

        let channel = engine.channel("flame-1").unwrap();
        assert_eq!(channel.consecutive(), 2);
        assert_eq!(channel.failures(), 0);

        assert!(engine.observe("flame-1", Ok(Reading::Digital(true))).is_some());
    }

    #[test]
    fn test_degrades_after_consecutive_failures() {
        let mut engine = engine(vec![spec("smoke-1", SensorKind::Smoke, 2)]);
        engine.observe("smoke-1", Ok(Reading::Digital(true)));

        for _ in 0..3 {
            assert!(engine.observe("smoke-1", Err(read_error())).is_none());
        }

        let channel = engine.channel("smoke-1").unwrap();
        assert_eq!(channel.state(), ChannelState::Degraded);
        assert_eq!(channel.consecutive(), 0);
        assert_eq!(channel.failures(), 3);
    }

    #[test]
    fn test_successful_read_clears_degraded() {
        let mut engine = engine(vec![spec("smoke-1", SensorKind::Smoke, 2)]);
        for _ in 0..4 {
            engine.observe("smoke-1", Err(read_error()));
        }
        assert_eq!(engine.state("smoke-1"), Some(ChannelState::Degraded));

        assert!(engine.observe("smoke-1", Ok(Reading::Digital(true))).is_none());
        let channel = engine.channel("smoke-1").unwrap();
        assert_eq!(channel.state(), ChannelState::Candidate);
        assert_eq!(channel.failures(), 0);

        assert!(engine.observe("smoke-1", Ok(Reading::Digital(true))).is_some());
    }

    #[test]
    fn test_sequence_numbers_increase_across_channels() {
        let mut engine = engine(vec![
            spec("smoke-1", SensorKind::Smoke, 1),
            spec("flame-1", SensorKind::Flame, 1),
        ]);

        let a = engine.observe("smoke-1", Ok(Reading::Digital(true))).unwrap();
        let b = engine.observe("flame-1", Ok(Reading::Digital(true))).unwrap();
        let c = engine.observe("smoke-1", Ok(Reading::Digital(true))).unwrap();

        assert!(a.sequence < b.sequence && b.sequence < c.sequence);
        assert_eq!(b.kind, SensorKind::Flame);
    }

    #[test]
    fn test_analog_channel() {
        let mut temp = spec("temp-1", SensorKind::Temperature, 2);
        temp.rule = TriggerRule::Above(35.0);
        let mut engine = engine(vec![temp]);

        assert!(engine.observe("temp-1", Ok(Reading::Analog(36.0))).is_none());
        let event = engine.observe("temp-1", Ok(Reading::Analog(37.5))).unwrap();
        assert_eq!(event.reading, Reading::Analog(37.5));
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let mut engine = engine(vec![spec("smoke-1", SensorKind::Smoke, 1)]);
        assert!(engine.observe("ghost", Ok(Reading::Digital(true))).is_none());
    }
}
