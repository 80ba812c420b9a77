//! Frame sink implementations.
//!
//! Real deployments plug in external writers and streamers; these
//! implementations cover the in-process needs: discarding frames, recording
//! them for inspection, and fanning them out to live subscribers over a
//! broadcast channel.

use crate::core::{BroadcastSink, Frame, StorageSink};
use crate::metadata::MetaMap;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

// ============================================================================
// Discard sinks
// ============================================================================

/// Storage sink that drops everything (logging at debug level).
#[derive(Debug, Default)]
pub struct DiscardStorage;

#[async_trait]
impl StorageSink for DiscardStorage {
    async fn store(&self, filename: &Path, _meta: &MetaMap, _frame: &Frame) {
        log::debug!("discarding frame for {}", filename.display());
    }
}

// ============================================================================
// Recording sink (tests and diagnostics)
// ============================================================================

/// A frame captured by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub filename: PathBuf,
    pub meta: MetaMap,
    pub frame: Frame,
}

/// Storage sink that records every frame in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    frames: Mutex<Vec<StoredFrame>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<StoredFrame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn store(&self, filename: &Path, meta: &MetaMap, frame: &Frame) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(StoredFrame {
                filename: filename.to_path_buf(),
                meta: meta.clone(),
                frame: frame.clone(),
            });
        }
    }
}

// ============================================================================
// Broadcast bus
// ============================================================================

/// A frame event published to live subscribers.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub label: String,
    pub meta: MetaMap,
    pub frame: Frame,
}

/// Broadcast sink backed by a `tokio::sync::broadcast` channel.
///
/// Subscribers come and go independently; sends with no receivers are
/// simply dropped. The live toggle gates publishing without detaching
/// subscribers.
pub struct FrameBus {
    tx: broadcast::Sender<FrameEvent>,
    live: AtomicBool,
    published: std::sync::atomic::AtomicU64,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            live: AtomicBool::new(false),
            published: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.tx.subscribe()
    }

    /// Number of frames actually published (live and off periods excluded).
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl BroadcastSink for FrameBus {
    async fn publish(&self, label: &str, meta: &MetaMap, frame: &Frame) {
        if !self.is_live() {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error for a live stream.
        let _ = self.tx.send(FrameEvent {
            label: label.to_string(),
            meta: meta.clone(),
            frame: frame.clone(),
        });
    }

    fn set_live(&self, on: bool) {
        self.live.store(on, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}
