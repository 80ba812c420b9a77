//! Simulated hardware for development and tests.
//!
//! `SimCamera` stands in for a detector behind the [`CameraDevice`] trait
//! (synthetic frames, exposure-time sleeps, optional fault injection), and
//! `SimDevice` is a minimal TCP instrument speaking the newline-terminated
//! command/reply protocol, for exercising a [`crate::link::DeviceLink`]
//! without hardware.

use crate::core::{CameraDevice, Frame, PixelBuffer};
use crate::error::{DaqError, DaqResult};
use crate::metadata::MetaMap;
use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

// ============================================================================
// Simulated camera
// ============================================================================

/// A camera that sleeps for the exposure time and produces noise frames.
pub struct SimCamera {
    name: String,
    shape: (u32, u32),
    exposure_time: Mutex<f64>,
    exposure_number: Mutex<u32>,
    trigger_count: AtomicU32,
    /// When set, the next trigger fails (for error-policy tests).
    fail_next_trigger: AtomicBool,
}

impl SimCamera {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            shape: (width, height),
            exposure_time: Mutex::new(0.01),
            exposure_number: Mutex::new(1),
            trigger_count: AtomicU32::new(0),
            fail_next_trigger: AtomicBool::new(false),
        }
    }

    pub fn trigger_count(&self) -> u32 {
        self.trigger_count.load(Ordering::Relaxed)
    }

    pub fn fail_next_trigger(&self) {
        self.fail_next_trigger.store(true, Ordering::Release);
    }

    fn exposure(&self) -> f64 {
        self.exposure_time
            .lock()
            .map(|t| *t)
            .unwrap_or(0.01)
    }
}

#[async_trait]
impl CameraDevice for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn pixel_size(&self) -> f64 {
        55.0
    }

    fn shape(&self) -> (u32, u32) {
        self.shape
    }

    fn max_fps(&self) -> f64 {
        20.0
    }

    fn default_fps(&self) -> f64 {
        5.0
    }

    async fn arm(&self) -> DaqResult<()> {
        debug!("{}: armed", self.name);
        Ok(())
    }

    async fn disarm(&self) -> DaqResult<()> {
        debug!("{}: disarmed", self.name);
        Ok(())
    }

    async fn trigger(&self) -> DaqResult<()> {
        if self.fail_next_trigger.swap(false, Ordering::AcqRel) {
            return Err(DaqError::Protocol("simulated trigger fault".into()));
        }
        sleep(Duration::from_secs_f64(self.exposure())).await;
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn readout(&self) -> DaqResult<(Frame, MetaMap)> {
        let (width, height) = self.shape;
        let mut rng = rand::thread_rng();
        let pixels: Vec<u16> = (0..(width as usize * height as usize))
            .map(|_| rng.gen_range(0..4096))
            .collect();
        let frame = Frame {
            width,
            height,
            pixels: PixelBuffer::U16(pixels),
        };
        let mut meta = MetaMap::new();
        meta.insert("shape".into(), json!([height, width]));
        meta.insert("dtype".into(), json!("uint16"));
        Ok((frame, meta))
    }

    async fn exposure_time(&self) -> DaqResult<f64> {
        Ok(self.exposure())
    }

    async fn set_exposure_time(&self, seconds: f64) -> DaqResult<()> {
        if seconds <= 0.0 {
            return Err(DaqError::Precondition(format!(
                "exposure time must be positive: {seconds}"
            )));
        }
        if let Ok(mut t) = self.exposure_time.lock() {
            *t = seconds;
        }
        Ok(())
    }

    async fn exposure_number(&self) -> DaqResult<u32> {
        Ok(self.exposure_number.lock().map(|n| *n).unwrap_or(1))
    }

    async fn set_exposure_number(&self, count: u32) -> DaqResult<()> {
        if count == 0 {
            return Err(DaqError::Precondition("exposure number must be at least 1".into()));
        }
        if let Ok(mut n) = self.exposure_number.lock() {
            *n = count;
        }
        Ok(())
    }

    async fn operation_mode(&self) -> DaqResult<MetaMap> {
        let mut mode = MetaMap::new();
        mode.insert("bit_depth".into(), json!(12));
        mode.insert("counter_mode".into(), json!("single"));
        Ok(mode)
    }
}

// ============================================================================
// Simulated TCP instrument
// ============================================================================

/// A newline-terminated command/reply instrument on a local port.
///
/// Commands: `STATUS` answers `OK`, `ID` answers the model string,
/// `EXP <seconds>` acknowledges an exposure setting, anything else is an
/// error reply.
pub struct SimDevice {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SimDevice {
    pub async fn spawn() -> DaqResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("sim device: connection from {peer}");
                        tokio::spawn(handle_connection(stream));
                    }
                    Err(e) => {
                        info!("sim device: accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match line.trim() {
            "STATUS" => "OK\n".to_string(),
            "ID" => "SIMCAM v1\n".to_string(),
            cmd if cmd.starts_with("EXP ") => match cmd[4..].parse::<f64>() {
                Ok(_) => "ACK\n".to_string(),
                Err(_) => "ERR bad value\n".to_string(),
            },
            other => format!("ERR unknown command: {other}\n"),
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_camera_cycle() {
        let cam = SimCamera::new("sim", 8, 4);
        cam.arm().await.unwrap();
        cam.trigger().await.unwrap();
        let (frame, meta) = cam.readout().await.unwrap();
        assert_eq!(frame.pixel_count(), 32);
        assert_eq!(meta["dtype"], "uint16");
        assert_eq!(cam.trigger_count(), 1);
        cam.disarm().await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_fault_injection() {
        let cam = SimCamera::new("sim", 4, 4);
        cam.fail_next_trigger();
        assert!(cam.trigger().await.is_err());
        // The fault is one-shot.
        assert!(cam.trigger().await.is_ok());
    }
}
