//! Bounded window of recently captured frames.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

/// A single captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Capture sequence number
    pub sequence: u64,

    /// Timestamp when the frame was captured
    pub captured_at: DateTime<Utc>,

    /// Encoded image bytes
    pub data: Bytes,

    /// Where the frame was persisted, if it was
    pub path: Option<PathBuf>,
}

impl Frame {
    pub fn new(sequence: u64, captured_at: DateTime<Utc>, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            captured_at,
            data: data.into(),
            path: None,
        }
    }
}

/// Immutable, oldest-first copy of the buffer taken at snapshot time.
#[derive(Debug, Default, PartialEq)]
pub struct FrameBundle {
    frames: Vec<Frame>,
}

impl FrameBundle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sum of encoded frame sizes in bytes.
    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.data.len()).sum()
    }

    /// Capture time of the oldest and newest frame.
    pub fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => Some((first.captured_at, last.captured_at)),
            _ => None,
        }
    }

    /// Persisted paths of the bundled frames.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.frames.iter().filter_map(|f| f.path.as_ref())
    }
}

/// Fixed-capacity FIFO of frames. Pushing past capacity evicts the oldest.
#[derive(Debug)]
pub struct FrameRingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
    evicted: u64,
}

impl FrameRingBuffer {
    /// Create a new frame buffer holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Insert a frame, returning the evicted oldest frame if the buffer was full.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.evicted += 1;
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Copy the current contents into an independent bundle.
    pub fn snapshot(&self) -> FrameBundle {
        FrameBundle {
            frames: self.frames.iter().cloned().collect(),
        }
    }

    /// Get the latest frame.
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get buffer size.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Bytes held by buffered frames.
    pub fn memory_usage(&self) -> usize {
        self.frames.iter().map(|f| f.data.len()).sum()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Ring buffer shared between the capture loop (single writer) and snapshot
/// readers.
pub type SharedFrameBuffer = Arc<RwLock<FrameRingBuffer>>;

pub fn shared(capacity: usize) -> SharedFrameBuffer {
    Arc::new(RwLock::new(FrameRingBuffer::new(capacity)))
}
