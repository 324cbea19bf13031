//! Sensor kinds, raw readings and the channel reader seam.
//!
//! Reading a line or an analog attribute is plain I/O. Everything stateful
//! about a channel lives in the debounce engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while reading a sensor channel.
#[derive(Debug, Error)]
pub enum SensorReadError {
    #[error("Failed to read channel {channel}: {source}")]
    Io {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel {channel} returned an unparseable value: {value:?}")]
    Parse { channel: String, value: String },

    #[error("Channel {0} is not available")]
    Unavailable(String),
}

/// Kind of environmental sensor behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Smoke,
    Flame,
    Temperature,
    Humidity,
    Water,
}

/// Alert severity derived from the sensor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Subject prefix for this severity.
    pub fn label(self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl SensorKind {
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Smoke,
        SensorKind::Flame,
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Water,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Smoke => "smoke",
            Self::Flame => "flame",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Water => "water",
        }
    }

    /// Digital kinds report a single active/inactive line.
    pub fn is_digital(self) -> bool {
        matches!(self, Self::Smoke | Self::Flame | Self::Water)
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Smoke | Self::Flame => Severity::Critical,
            Self::Water => Severity::Error,
            Self::Temperature | Self::Humidity => Severity::Warning,
        }
    }

    /// Consecutive triggering reads required when nothing is configured.
    pub fn default_threshold(self) -> u32 {
        match self {
            Self::Smoke => 2,
            Self::Flame => 3,
            Self::Water => 1,
            Self::Temperature | Self::Humidity => 3,
        }
    }

    /// Default `(below, above)` trigger bounds for analog kinds.
    pub fn default_bounds(self) -> (Option<f64>, Option<f64>) {
        match self {
            Self::Temperature => (Some(10.0), Some(35.0)),
            Self::Humidity => (Some(20.0), Some(80.0)),
            _ => (None, None),
        }
    }

    /// Unit rendered next to analog values.
    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            _ => "",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smoke" => Ok(Self::Smoke),
            "flame" => Ok(Self::Flame),
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "water" => Ok(Self::Water),
            other => Err(format!("unknown sensor kind: {}", other)),
        }
    }
}

/// A raw value read from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Digital(bool),
    Analog(f64),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digital(true) => f.write_str("active"),
            Self::Digital(false) => f.write_str("inactive"),
            Self::Analog(v) => write!(f, "{:.1}", v),
        }
    }
}

/// Decides whether a reading counts as triggering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerRule {
    /// Digital line is active
    Active,
    /// Analog value strictly above the bound
    Above(f64),
    /// Analog value strictly below the bound
    Below(f64),
    /// Analog value outside `[low, high]`
    Outside { low: f64, high: f64 },
}

impl TriggerRule {
    /// Build an analog rule from optional bounds.
    pub fn from_bounds(below: Option<f64>, above: Option<f64>) -> Option<Self> {
        match (below, above) {
            (Some(low), Some(high)) => Some(Self::Outside { low, high }),
            (None, Some(high)) => Some(Self::Above(high)),
            (Some(low), None) => Some(Self::Below(low)),
            (None, None) => None,
        }
    }

    pub fn is_triggering(&self, reading: &Reading) -> bool {
        match (self, reading) {
            (Self::Active, Reading::Digital(active)) => *active,
            (Self::Above(high), Reading::Analog(v)) => v > high,
            (Self::Below(low), Reading::Analog(v)) => v < low,
            (Self::Outside { low, high }, Reading::Analog(v)) => v < low || v > high,
            // A reading of the wrong shape never triggers.
            _ => false,
        }
    }
}

/// Resolved, immutable description of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub id: String,
    pub kind: SensorKind,
    pub source: PathBuf,
    pub active_low: bool,
    pub scale: f64,
    pub threshold: u32,
    pub rule: TriggerRule,
}

/// Produces one raw reading per channel per poll tick.
///
/// Implementations must return quickly; the poll loop calls them inline.
pub trait SensorReader: Send {
    fn read(&mut self, channel: &ChannelSpec) -> Result<Reading, SensorReadError>;
}

/// Reads channel values from files such as sysfs GPIO `value` attributes or
/// IIO/hwmon inputs.
#[derive(Debug, Default)]
pub struct FileSensorReader;

impl FileSensorReader {
    /// Create a reader after checking every channel source exists.
    pub fn open(channels: &[ChannelSpec]) -> Result<Self, SensorReadError> {
        for channel in channels {
            if !channel.source.exists() {
                return Err(SensorReadError::Unavailable(format!(
                    "{} ({})",
                    channel.id,
                    channel.source.display()
                )));
            }
        }
        Ok(Self)
    }

    fn read_raw(channel: &ChannelSpec, path: &Path) -> Result<String, SensorReadError> {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|source| SensorReadError::Io {
                channel: channel.id.clone(),
                source,
            })
    }
}

impl SensorReader for FileSensorReader {
    fn read(&mut self, channel: &ChannelSpec) -> Result<Reading, SensorReadError> {
        let raw = Self::read_raw(channel, &channel.source)?;
        let reading = parse_reading(channel, &raw)?;
        debug!(channel = %channel.id, raw = %raw, reading = %reading, "Channel read");
        Ok(reading)
    }
}

/// Turn the textual value of a channel into a reading.
pub fn parse_reading(channel: &ChannelSpec, raw: &str) -> Result<Reading, SensorReadError> {
    let parse_error = || SensorReadError::Parse {
        channel: channel.id.clone(),
        value: raw.to_string(),
    };

    if channel.kind.is_digital() {
        let level = match raw {
            "1" | "high" | "true" => true,
            "0" | "low" | "false" => false,
            _ => return Err(parse_error()),
        };
        Ok(Reading::Digital(level != channel.active_low))
    } else {
        let value: f64 = raw.parse().map_err(|_| parse_error())?;
        if !value.is_finite() {
            return Err(parse_error());
        }
        Ok(Reading::Analog(value * channel.scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn digital_channel(active_low: bool) -> ChannelSpec {
        ChannelSpec {
            id: "smoke-1".to_string(),
            kind: SensorKind::Smoke,
            source: PathBuf::from("/nonexistent"),
            active_low,
            scale: 1.0,
            threshold: 2,
            rule: TriggerRule::Active,
        }
    }

    fn analog_channel() -> ChannelSpec {
        ChannelSpec {
            id: "temp-1".to_string(),
            kind: SensorKind::Temperature,
            source: PathBuf::from("/nonexistent"),
            active_low: false,
            scale: 0.001,
            threshold: 3,
            rule: TriggerRule::Outside {
                low: 10.0,
                high: 35.0,
            },
        }
    }

    #[test]
    fn test_kind_round_trip_from_str() {
        for kind in SensorKind::ALL {
            assert_eq!(SensorKind::from_str(kind.as_str()), Ok(kind));
        }
        assert!(SensorKind::from_str("FLAME").is_ok());
        assert!(SensorKind::from_str("radon").is_err());
    }

    #[test]
    fn test_active_low_inversion() {
        let channel = digital_channel(true);
        assert_eq!(parse_reading(&channel, "0").unwrap(), Reading::Digital(true));
        assert_eq!(parse_reading(&channel, "1").unwrap(), Reading::Digital(false));

        let channel = digital_channel(false);
        assert_eq!(parse_reading(&channel, "1").unwrap(), Reading::Digital(true));
    }

    #[test]
    fn test_analog_scale() {
        let channel = analog_channel();
        assert_eq!(
            parse_reading(&channel, "36500").unwrap(),
            Reading::Analog(36.5)
        );
    }

    #[test]
    fn test_garbage_value_is_parse_error() {
        assert!(matches!(
            parse_reading(&digital_channel(false), "2"),
            Err(SensorReadError::Parse { .. })
        ));
        assert!(matches!(
            parse_reading(&analog_channel(), "NaN"),
            Err(SensorReadError::Parse { .. })
        ));
    }

    #[test]
    fn test_trigger_rules() {
        assert!(TriggerRule::Active.is_triggering(&Reading::Digital(true)));
        assert!(!TriggerRule::Active.is_triggering(&Reading::Digital(false)));
        assert!(!TriggerRule::Active.is_triggering(&Reading::Analog(1.0)));

        let rule = TriggerRule::Outside {
            low: 10.0,
            high: 35.0,
        };
        assert!(rule.is_triggering(&Reading::Analog(36.0)));
        assert!(rule.is_triggering(&Reading::Analog(9.5)));
        assert!(!rule.is_triggering(&Reading::Analog(35.0)));

        assert!(TriggerRule::Above(80.0).is_triggering(&Reading::Analog(81.0)));
        assert!(TriggerRule::Below(20.0).is_triggering(&Reading::Analog(19.0)));
        assert_eq!(TriggerRule::from_bounds(None, None), None);
    }

    #[test]
    fn test_file_reader() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0").unwrap();

        let mut channel = digital_channel(true);
        channel.source = file.path().to_path_buf();

        let mut reader = FileSensorReader::open(std::slice::from_ref(&channel)).unwrap();
        assert_eq!(reader.read(&channel).unwrap(), Reading::Digital(true));
    }

    #[test]
    fn test_file_reader_missing_source() {
        let channel = digital_channel(false);
        assert!(matches!(
            FileSensorReader::open(&[channel]),
            Err(SensorReadError::Unavailable(_))
        ));
    }
}
