//! RoomGuard Machine Room Monitor
//!
//! Single-node hazard monitor for a machine room. Digital (smoke, flame,
//! water) and analog (temperature, humidity) channels are polled at a fixed
//! interval; sustained readings become confirmed events, which are emailed to
//! operators together with the most recent camera frames.
//!
//! ## Features
//!
//! - **Debounced detection**: a channel confirms only after `threshold`
//!   consecutive triggering reads; failing channels degrade instead of firing
//! - **Frame ring buffer**: bounded window of recent stills, snapshotted per
//!   alert and shipped as a ZIP attachment
//! - **Alert dispatch**: per-kind cooldown, bounded queue that drops the
//!   oldest job, exponential retry with per-attempt timeouts
//! - **Storage reaper**: age and size quotas over frames, archives and logs,
//!   never touching files an in-flight alert still needs
//! - **Watchdog**: bounded restarts in a sliding window, resource ceilings,
//!   JSON status file for process managers
//!
//! ## Architecture
//!
//! ```text
//!  Sensor channels          Camera
//!  ┌──────────────┐         ┌──────────────┐
//!  │ SensorReader │         │ CaptureLoop  │
//!  └──────┬───────┘         └──────┬───────┘
//!         ▼                        ▼
//!  ┌──────────────┐  snapshot ┌──────────────┐
//!  │ Debounce     │◀──────────│ FrameRing    │
//!  │ Engine       │           │ Buffer       │
//!  └──────┬───────┘           └──────────────┘
//!         │ enqueue (non-blocking)
//!         ▼
//!  ┌──────────────┐           ┌──────────────┐
//!  │ Alert        │──────────▶│ Email        │
//!  │ Dispatcher   │           │ Transport    │
//!  └──────────────┘           └──────────────┘
//!
//!  Supervisor ── restarts the monitor incarnation, samples health
//!  StorageReaper ── periodic sweeps, honours pinned files
//! ```

pub mod capture;
pub mod config;
pub mod debounce;
pub mod dispatcher;
pub mod frame_buffer;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod packaging;
pub mod reaper;
pub mod sensor;
pub mod service;
pub mod supervisor;
pub mod transport;

pub use config::{ConfigValidationError, MonitorConfig};
pub use debounce::{ChannelState, DebounceEngine, Event, SequenceGenerator};
pub use dispatcher::{Admission, AlertDispatcher, DispatchStats, JobStatus, ShutdownReport};
pub use frame_buffer::{Frame, FrameBundle, FrameRingBuffer};
pub use monitor::{Monitor, MonitorContext};
pub use reaper::{PinRegistry, ReclaimReport, StorageReaper};
pub use sensor::{Reading, SensorKind, Severity};
pub use service::{Service, ServiceExit};
pub use supervisor::{Supervisor, SupervisorExit, SupervisorHandle, SupervisorState};
pub use transport::{EmailTransport, OutgoingEmail, TransportError};
