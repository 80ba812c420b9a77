//! Core traits and data types for the instrument-control system.
//!
//! This module defines the foundational abstractions shared by the device
//! link, the acquisition engine, and the experiment manager:
//!
//! - [`Frame`] / [`PixelBuffer`]: detector frames in their native bit depth
//! - [`LinkState`]: lifecycle state of a device connection
//! - [`CameraDevice`]: the device-specific half of the acquisition engine
//!   (arming, triggering, readout, exposure parameters)
//! - [`ExperimentLink`]: the engine-facing boundary to the experiment
//!   manager (scan state, shared frame numbering, metadata aggregation)
//! - [`StorageSink`] / [`BroadcastSink`]: opaque fire-and-forget consumers
//!   of completed frames
//!
//! # Data Flow
//!
//! ```text
//! CameraDevice --(trigger/readout)--> CameraEngine --+--> BroadcastSink
//!                                                    +--> StorageSink
//! ExperimentLink --(aggregate metadata)--------------^
//! ```
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync`: every long-running duty is a separate
//! Tokio task, and device handles are shared across them behind `Arc`.

use crate::error::DaqResult;
use crate::metadata::MetaMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Frames
// =============================================================================

/// Pixel storage in the detector's native format.
///
/// Camera sensors typically output 8-bit or 16-bit unsigned integers;
/// keeping the native depth avoids an 8x memory blowup from eagerly
/// converting everything to `f64`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
    /// 64-bit floating point pixels (for computed images)
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// Number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
            PixelBuffer::F64(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
            PixelBuffer::F64(data) => data.len() * 8,
        }
    }
}

/// A single detector frame in row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
}

impl Frame {
    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

// =============================================================================
// Device link state
// =============================================================================

/// Lifecycle state of a device connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

// =============================================================================
// Device-specific camera operations
// =============================================================================

/// The device-specific half of the acquisition engine.
///
/// Concrete detector drivers implement this trait; the engine supplies the
/// state machine, the loops, and the sink hand-off. `trigger` blocks until
/// the exposure is complete; `readout` runs afterwards and returns the
/// frame together with per-frame metadata (shape, dtype, hardware stamps).
///
/// `disarm` may be invoked more than once per session (once by an explicit
/// caller and once by the acquisition loop's exit path) and must tolerate
/// that.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Detector identity used in metadata and sink labels.
    fn name(&self) -> &str;

    /// Physical pixel pitch in micrometers.
    fn pixel_size(&self) -> f64;

    /// Native array dimensions (width, height).
    fn shape(&self) -> (u32, u32);

    /// Highest frame rate the device supports in rolling mode.
    fn max_fps(&self) -> f64 {
        5.0
    }

    /// Frame rate used for rolling mode when the caller does not choose one.
    fn default_fps(&self) -> f64 {
        5.0
    }

    /// Device-specific arming. After this returns, `trigger` must be able
    /// to start an acquisition without further setup.
    async fn arm(&self) -> DaqResult<()>;

    /// Device-specific disarming. Must be idempotent.
    async fn disarm(&self) -> DaqResult<()>;

    /// Device-specific re-arm between frames of an armed session.
    async fn rearm(&self) -> DaqResult<()> {
        Ok(())
    }

    /// Start the exposure and block until it is done.
    async fn trigger(&self) -> DaqResult<()>;

    /// Read the acquired frame and its per-frame metadata.
    async fn readout(&self) -> DaqResult<(Frame, MetaMap)>;

    async fn exposure_time(&self) -> DaqResult<f64>;
    async fn set_exposure_time(&self, seconds: f64) -> DaqResult<()>;
    async fn exposure_number(&self) -> DaqResult<u32>;
    async fn set_exposure_number(&self, count: u32) -> DaqResult<()>;

    /// Device-specific operation mode as a key/value map.
    async fn operation_mode(&self) -> DaqResult<MetaMap>;
}

// =============================================================================
// Experiment boundary
// =============================================================================

/// Record returned by `start_scan`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanInfo {
    pub scan_number: u32,
    pub scan_name: String,
    pub investigation: String,
    pub experiment: String,
    pub path: PathBuf,
}

/// Record returned by `end_scan`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_number: u32,
    pub scan_name: String,
    pub investigation: String,
    pub experiment: String,
    pub path: PathBuf,
    /// Number of frame prefixes handed out during the scan.
    pub count: u64,
}

/// The acquisition engine's view of the experiment manager.
///
/// During a joint scan the ledger behind this trait is shared by every
/// armed engine; `next_prefix` is the single point of contention for frame
/// numbering and must hand out each value exactly once.
#[async_trait]
pub trait ExperimentLink: Send + Sync {
    /// Scan directory relative to the data root, `None` when no scan runs.
    async fn scan_path(&self) -> Option<PathBuf>;

    /// Full scan name, `None` when no scan runs.
    async fn scan_name(&self) -> Option<String>;

    /// Next shared filename prefix; increments the per-scan counter.
    async fn next_prefix(&self) -> DaqResult<String>;

    /// Aggregate metadata from all live sources, waiting `window` between
    /// dispatch and collection. Best-effort: slow sources are omitted.
    async fn aggregate_meta(&self, window: std::time::Duration) -> MetaMap;
}

// =============================================================================
// Sinks
// =============================================================================

/// Consumer of completed frames bound for permanent storage.
///
/// Fire-and-forget from the engine's perspective: errors surface through
/// sink-side logging only and never stall the acquisition loop.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store(&self, filename: &Path, meta: &MetaMap, frame: &Frame);
}

/// Consumer of frames bound for live viewers.
///
/// The engine hands every frame over unconditionally; the sink honors its
/// own live on/off toggle.
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn publish(&self, label: &str, meta: &MetaMap, frame: &Frame);
    fn set_live(&self, on: bool);
    fn is_live(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_sizes() {
        let buf = PixelBuffer::U16(vec![0; 16]);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.memory_bytes(), 32);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_frame_pixel_count() {
        let frame = Frame {
            width: 4,
            height: 3,
            pixels: PixelBuffer::U8(vec![0; 12]),
        };
        assert_eq!(frame.pixel_count(), 12);
    }

    #[test]
    fn test_link_state_roundtrip() {
        let s = serde_json::to_string(&LinkState::Connected).unwrap();
        let back: LinkState = serde_json::from_str(&s).unwrap();
        assert_eq!(back, LinkState::Connected);
    }
}
