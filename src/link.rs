//! Persistent command/reply link to a physical instrument.
//!
//! A [`DeviceLink`] owns one TCP connection to a device speaking a
//! line-terminated command/reply protocol. The protocol has no framing
//! beyond the terminator sequence, so the background receiver task
//! reassembles partial reads until the terminator is seen, then publishes
//! the complete reply and wakes the waiting sender.
//!
//! Locking is deliberately narrow: the buffer guard is held only around
//! buffer mutation (clear-before-send, snapshot-after-reply), never across
//! the reply wait, so the receiver task can keep appending data while a
//! sender blocks. A separate writer guard serializes whole command/reply
//! exchanges, which keeps at most one pair in flight per link.
//!
//! The keep-alive watchdog periodically issues an inert status command.
//! Timeouts only bump a no-reply counter; a distinguishable disconnection
//! tears the connection down and marks the link disconnected, leaving the
//! decision to restart to the owner.

use crate::config::LinkSettings;
use crate::core::LinkState;
use crate::error::{DaqError, DaqResult};
use crate::event::Event;
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// Receive buffer plus the reply-ready flag, mutated together under one
/// guard so clearing is atomic with signal reset.
struct ReplyBuf {
    data: BytesMut,
    ready: bool,
}

struct Shared {
    buf: StdMutex<ReplyBuf>,
    notify: Notify,
}

/// Handles of the per-connection receiver task.
struct Receiver {
    stop: Arc<Event>,
    task: JoinHandle<()>,
}

/// Supervised TCP connection to one instrument.
pub struct DeviceLink {
    name: String,
    host: String,
    port: u16,
    eol: Vec<u8>,
    settings: LinkSettings,
    state: StdMutex<LinkState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    shared: Arc<Shared>,
    receiver: StdMutex<Option<Receiver>>,
    /// Receiver task hit a socket error or EOF; the connection is dead
    /// even though teardown has not run yet.
    broken: Arc<AtomicBool>,
    /// Link-wide shutdown; also stops the keep-alive loop.
    shutdown: Arc<Event>,
    no_reply: AtomicU32,
}

impl DeviceLink {
    /// Create a link to `host:port`. `eol` is the reply terminator the
    /// device uses; commands are sent exactly as given (no implicit
    /// terminator appended).
    pub fn new(name: &str, host: &str, port: u16, eol: &[u8], settings: LinkSettings) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            eol: eol.to_vec(),
            settings,
            state: StdMutex::new(LinkState::Disconnected),
            writer: Mutex::new(None),
            shared: Arc::new(Shared {
                buf: StdMutex::new(ReplyBuf {
                    data: BytesMut::new(),
                    ready: false,
                }),
                notify: Notify::new(),
            }),
            receiver: StdMutex::new(None),
            broken: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Event::new()),
            no_reply: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(LinkState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected && !self.broken.load(Ordering::Acquire)
    }

    /// Consecutive keep-alive probes that got no reply.
    pub fn no_reply_count(&self) -> u32 {
        self.no_reply.load(Ordering::Relaxed)
    }

    fn set_state(&self, s: LinkState) {
        if let Ok(mut state) = self.state.lock() {
            *state = s;
        }
    }

    /// Open the connection with the configured retry budget, then start
    /// the background receiver task.
    pub async fn connect(&self) -> DaqResult<()> {
        if self.state() == LinkState::Connected {
            return Err(DaqError::Precondition(format!(
                "link {} is already connected",
                self.name
            )));
        }
        self.set_state(LinkState::Connecting);

        let addr = format!("{}:{}", self.host, self.port);
        let mut last_err = None;
        let mut stream = None;
        for attempt in 1..=self.settings.connect_retries {
            match TcpStream::connect(&addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(
                        "{}: connection attempt {}/{} to {} failed: {}",
                        self.name, attempt, self.settings.connect_retries, addr, e
                    );
                    last_err = Some(e);
                    sleep(self.settings.retry_delay).await;
                }
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                self.set_state(LinkState::Disconnected);
                return Err(DaqError::ConnectivityLost(format!(
                    "cannot connect to {} after {} attempts: {}",
                    addr,
                    self.settings.connect_retries,
                    last_err.map_or_else(|| "unknown error".into(), |e| e.to_string())
                )));
            }
        };

        let (read_half, write_half) = stream.into_split();

        // Fresh per-connection state.
        if let Ok(mut buf) = self.shared.buf.lock() {
            buf.data.clear();
            buf.ready = false;
        }
        self.broken.store(false, Ordering::Release);
        self.no_reply.store(0, Ordering::Relaxed);

        let stop = Arc::new(Event::new());
        let task = tokio::spawn(recv_loop(
            read_half,
            Arc::clone(&self.shared),
            Arc::clone(&stop),
            Arc::clone(&self.broken),
            self.eol.clone(),
            self.settings.poll_interval,
            self.name.clone(),
        ));
        if let Ok(mut receiver) = self.receiver.lock() {
            *receiver = Some(Receiver { stop, task });
        }

        *self.writer.lock().await = Some(write_half);
        self.set_state(LinkState::Connected);
        info!("{} connected to {}", self.name, addr);
        Ok(())
    }

    /// Send `cmd` and wait for one terminator-delimited reply.
    ///
    /// Fails immediately when the link is not connected. The reply wait is
    /// bounded by the configured reply timeout; on expiry the command is
    /// considered lost and `DaqError::Timeout` is returned.
    pub async fn send_and_wait(&self, cmd: &[u8]) -> DaqResult<Bytes> {
        if self.state() != LinkState::Connected {
            return Err(DaqError::NotConnected);
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(DaqError::ConnectivityLost(format!(
                "{}: receiver task has stopped",
                self.name
            )));
        }

        // Writer guard: held for the whole exchange, so only one
        // command/reply pair is ever in flight.
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(DaqError::NotConnected)?;

        {
            // Clear leftovers and reset the ready signal atomically.
            let mut buf = self
                .shared
                .buf
                .lock()
                .map_err(|_| DaqError::Protocol("receive buffer poisoned".into()))?;
            buf.data.clear();
            buf.ready = false;
        }

        if let Err(e) = stream.write_all(cmd).await {
            self.broken.store(true, Ordering::Release);
            return Err(DaqError::ConnectivityLost(format!(
                "{}: write failed: {}",
                self.name, e
            )));
        }

        // Wait for the reply outside the buffer guard.
        let deadline = Instant::now() + self.settings.reply_timeout;
        loop {
            {
                let mut buf = self
                    .shared
                    .buf
                    .lock()
                    .map_err(|_| DaqError::Protocol("receive buffer poisoned".into()))?;
                if buf.ready {
                    buf.ready = false;
                    return Ok(buf.data.split().freeze());
                }
            }
            if self.broken.load(Ordering::Acquire) {
                return Err(DaqError::ConnectivityLost(format!(
                    "{}: connection lost while waiting for reply",
                    self.name
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DaqError::Timeout(self.settings.reply_timeout));
            }
            let wait = std::cmp::min(self.settings.poll_interval, deadline - now);
            let _ = timeout(wait, self.shared.notify.notified()).await;
        }
    }

    /// Start the keep-alive watchdog. `probe` is an inert status command
    /// (terminator included) that the device answers without side effects.
    ///
    /// The loop never terminates the process: timeouts bump the no-reply
    /// counter, a detected disconnection closes the connection and leaves
    /// the link disconnected for the owner to restart.
    pub fn spawn_keep_alive(self: Arc<Self>, probe: Vec<u8>) -> JoinHandle<()> {
        let link = self;
        tokio::spawn(async move {
            loop {
                if link.shutdown.wait_timeout(link.settings.keepalive_interval).await {
                    break;
                }
                // Probe whenever nominally connected; a broken connection
                // then surfaces as a disconnection error and is torn down.
                if link.state() != LinkState::Connected {
                    continue;
                }
                match link.send_and_wait(&probe).await {
                    Ok(_) => {
                        link.no_reply.store(0, Ordering::Relaxed);
                    }
                    Err(DaqError::Timeout(_)) => {
                        let n = link.no_reply.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!("{}: keep-alive got no reply ({} consecutive)", link.name, n);
                    }
                    Err(e) if e.is_disconnection() => {
                        error!("{}: device disconnected: {}", link.name, e);
                        link.close().await;
                    }
                    Err(e) => {
                        debug!("{}: keep-alive probe failed: {}", link.name, e);
                    }
                }
            }
            debug!("{}: keep-alive loop exiting", link.name);
        })
    }

    /// Tear down the current connection: stop the receiver task, close the
    /// socket, mark disconnected. Idempotent; the keep-alive loop keeps
    /// running (idle) so the link can be restarted.
    pub async fn close(&self) {
        let receiver = self.receiver.lock().ok().and_then(|mut r| r.take());
        if let Some(receiver) = receiver {
            receiver.stop.set();
            // Receiver polls with a short timeout, so this join is bounded.
            let join = timeout(self.settings.poll_interval * 3, receiver.task).await;
            if join.is_err() {
                warn!("{}: receiver task did not exit in time", self.name);
            }
        }
        *self.writer.lock().await = None;
        self.set_state(LinkState::Disconnected);
        info!("{} disconnected", self.name);
    }

    /// Close and reconnect.
    pub async fn restart(&self) -> DaqResult<()> {
        self.close().await;
        self.connect().await
    }

    /// Full shutdown: stops the keep-alive loop and closes the connection.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.set();
        self.close().await;
    }
}

/// Background receiver: polls the socket with a short timeout so stop
/// requests are observed promptly, reassembles data until the terminator
/// is seen, then publishes the reply and fires the ready signal.
async fn recv_loop(
    mut read_half: OwnedReadHalf,
    shared: Arc<Shared>,
    stop: Arc<Event>,
    broken: Arc<AtomicBool>,
    eol: Vec<u8>,
    poll: std::time::Duration,
    name: String,
) {
    use tokio::io::AsyncReadExt;

    let mut pending = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    debug!("{name}: receiver task started");
    loop {
        if stop.is_set() {
            break;
        }
        match timeout(poll, read_half.read(&mut chunk)).await {
            Err(_) => continue, // poll timeout, re-check stop flag
            Ok(Ok(0)) => {
                error!("{name}: connection closed by device");
                broken.store(true, Ordering::Release);
                break;
            }
            Ok(Ok(n)) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = find_terminator(&pending, &eol) {
                    let reply = pending.split_to(pos + eol.len());
                    if let Ok(mut buf) = shared.buf.lock() {
                        buf.data.extend_from_slice(&reply);
                        buf.ready = true;
                    }
                    shared.notify.notify_waiters();
                }
            }
            Ok(Err(e)) => {
                error!("{name}: socket error: {e}");
                broken.store(true, Ordering::Release);
                break;
            }
        }
    }
    shared.notify.notify_waiters();
    debug!("{name}: receiver task exiting");
}

/// Position of the first occurrence of `eol` in `data`.
fn find_terminator(data: &[u8], eol: &[u8]) -> Option<usize> {
    if eol.is_empty() || data.len() < eol.len() {
        return None;
    }
    data.windows(eol.len()).position(|w| w == eol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_terminator() {
        assert_eq!(find_terminator(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find_terminator(b"abc", b"\r\n"), None);
        assert_eq!(find_terminator(b"\n", b"\n"), Some(0));
        assert_eq!(find_terminator(b"", b"\n"), None);
    }

    #[tokio::test]
    async fn test_command_while_disconnected_fails_fast() {
        let link = DeviceLink::new(
            "cam",
            "127.0.0.1",
            1,
            b"\n",
            LinkSettings::default(),
        );
        let err = link.send_and_wait(b"STATUS\n").await.unwrap_err();
        assert!(matches!(err, DaqError::NotConnected));
    }
}
