//! Load session: reset, handshake, chunked transfer and checksum verification with retries.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use super::checksum::Checksum;
use super::error::{LoaderError, Result};
use super::handle::CancelToken;
use super::protocol;
use super::types::{Destination, RESET_ASSERT, RESET_RELEASE, SessionState};
use crate::config::LoaderConfig;
use crate::device::DeviceRecord;
use crate::events::{EventSink, LoadEvent, LoadOutcome};
use crate::xbee::io::Link;
use crate::xbee::protocol::build_at_command;
use crate::xbee::types::AT_IO_OUTPUT;

pub(crate) type DeviceKey = (Ipv4Addr, u16);
pub(crate) type ActiveDevices = Arc<Mutex<HashSet<DeviceKey>>>;

/// Marks a device as busy for as long as it lives.
pub(crate) struct BusyGuard {
    active: ActiveDevices,
    key: DeviceKey,
}

impl BusyGuard {
    /// `None` if the device already has a session.
    pub(crate) fn acquire(active: &ActiveDevices, key: DeviceKey) -> Option<Self> {
        let mut set = active.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(key) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            key,
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.key);
    }
}

/// Mutable state of one load.
#[derive(Debug)]
struct LoadSession {
    state: SessionState,
    attempts_remaining: u32,
    bytes_sent: usize,
    total_bytes: usize,
    target: DeviceRecord,
    destination: Destination,
}

/// How an attempt or session ended, short of an error.
enum Step {
    Done,
    Cancelled,
}

/// Result of waiting for a reply.
enum Wait<T> {
    Got(T),
    TimedOut,
    Cancelled,
}

/// Everything a session needs, captured when the load starts.
pub(crate) struct SessionParams {
    pub image: Vec<u8>,
    pub destination: Destination,
    pub target: DeviceRecord,
    pub max_attempts: u32,
    pub command_port: u16,
    pub config: LoaderConfig,
    pub checksum: Arc<dyn Checksum>,
    pub events: EventSink,
    pub cancel: CancelToken,
}

/// Drives one [`LoadSession`] from `Idle` to a terminal state.
pub(crate) struct SessionRunner {
    session: LoadSession,
    max_attempts: u32,
    image: Arc<[u8]>,
    expected_checksum: i32,
    checksum: Arc<dyn Checksum>,
    command_port: u16,
    config: LoaderConfig,
    events: EventSink,
    cancel: CancelToken,
    last_progress: Option<f32>,
}

impl SessionRunner {
    pub(crate) fn new(params: SessionParams) -> Self {
        let expected_checksum = params.checksum.compute_checksum(&params.image);
        Self {
            session: LoadSession {
                state: SessionState::Idle,
                attempts_remaining: params.max_attempts,
                bytes_sent: 0,
                total_bytes: params.image.len(),
                target: params.target,
                destination: params.destination,
            },
            max_attempts: params.max_attempts,
            image: params.image.into(),
            expected_checksum,
            checksum: params.checksum,
            command_port: params.command_port,
            config: params.config,
            events: params.events,
            cancel: params.cancel,
            last_progress: None,
        }
    }

    /// Run to completion and emit exactly one terminal event.
    ///
    /// The socket is closed and the device released before the terminal event is sent.
    pub(crate) async fn run(mut self, busy: BusyGuard) {
        let result = self.drive().await;
        drop(busy);

        match result {
            Ok(Step::Done) => {
                info!(
                    "Loaded {} bytes into {} of {}",
                    self.session.total_bytes, self.session.destination, self.session.target
                );
                self.enter(SessionState::Complete);
                self.emit_progress(1.0);
                self.events.finish(LoadOutcome::Complete);
            }
            Ok(Step::Cancelled) => {
                info!("Load to {} cancelled", self.session.target);
                self.enter(SessionState::Cancelled);
                self.events.finish(LoadOutcome::Cancelled);
            }
            Err(e) => {
                error!("Load to {} failed: {e}", self.session.target);
                self.enter(SessionState::FatalError);
                self.events.finish(LoadOutcome::Failed(e));
            }
        }
    }

    /// Bind the session's socket, run the attempts and close the socket on every exit.
    async fn drive(&mut self) -> Result<Step> {
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        let link = Link::bind(SocketAddr::from(([0, 0, 0, 0], 0)), false).await?;
        let result = self.attempts(&link).await;
        link.close().await;
        result
    }

    /// Repeat full reset cycles until one succeeds, the attempts run out, or a fatal error.
    async fn attempts(&mut self, link: &Link) -> Result<Step> {
        loop {
            match self.attempt(link).await {
                Ok(step) => return Ok(step),
                Err(e) if e.is_retryable() => {
                    self.session.attempts_remaining -= 1;
                    let remaining = self.session.attempts_remaining;
                    warn!("Attempt on {} failed: {e} ({remaining} left)", self.session.target);
                    self.events.send(LoadEvent::AttemptFailed {
                        attempts_remaining: remaining,
                    });
                    if remaining == 0 {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One reset/handshake/transfer/verify cycle.
    async fn attempt(&mut self, link: &Link) -> Result<Step> {
        let command_addr = self.session.target.command_addr(self.command_port);
        let serial_addr = self.session.target.serial_addr();

        // Resetting
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        self.enter(SessionState::Resetting);
        let stale = link.flush();
        if stale > 0 {
            debug!("Discarded {stale} stale datagram(s)");
        }
        self.session.bytes_sent = 0;

        link.send_to(&build_at_command(AT_IO_OUTPUT, &RESET_ASSERT), command_addr)
            .await?;
        link.send_to(&build_at_command(AT_IO_OUTPUT, &RESET_RELEASE), command_addr)
            .await?;
        if self.pause(self.config.reset_delay()).await {
            return Ok(Step::Cancelled);
        }
        link.send_to(&protocol::handshake_packet(), serial_addr).await?;

        // AwaitingHandshake
        self.enter(SessionState::AwaitingHandshake);
        let version = match self
            .wait_for(link, self.config.handshake_timeout(), protocol::parse_handshake_reply)
            .await?
        {
            Wait::Got(version) => version,
            Wait::TimedOut => {
                warn!("No handshake from {}", self.session.target);
                return Err(LoaderError::NoResponseToReset);
            }
            Wait::Cancelled => return Ok(Step::Cancelled),
        };
        debug!("Handshake OK, chip version {version}");

        // Transferring
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        self.enter(SessionState::Transferring);
        self.emit_progress(0.0);
        let header = protocol::transfer_header(self.session.destination, self.session.total_bytes as u32);
        link.send_to(&header, serial_addr).await?;

        let image = Arc::clone(&self.image);
        for (index, chunk) in image.chunks(self.config.chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(Step::Cancelled);
            }

            // Wraps for images of more than 65536 chunks; acks are matched in order anyway.
            let seq = index as u16;
            let offset = self.session.bytes_sent as u32;
            link.send_to(&protocol::chunk_packet(seq, offset, chunk), serial_addr)
                .await?;

            let ack = self
                .wait_for(link, self.config.ack_timeout(), |payload| {
                    protocol::parse_ack(payload).filter(|&acked| acked == seq)
                })
                .await?;
            match ack {
                Wait::Got(_) => {}
                Wait::TimedOut => {
                    warn!("No ack for chunk {seq} at offset {offset}");
                    return Err(LoaderError::NoResponseAfterHandshake);
                }
                Wait::Cancelled => return Ok(Step::Cancelled),
            }

            self.session.bytes_sent += chunk.len();
            self.report_progress();
        }

        // Verifying
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        self.enter(SessionState::Verifying);
        link.send_to(&protocol::verify_packet(), serial_addr).await?;

        let verify_timeout = match self.session.destination {
            Destination::Ram => self.config.verify_timeout(),
            Destination::Eeprom => self.config.eeprom_verify_timeout(),
        };
        let actual = match self
            .wait_for(link, verify_timeout, protocol::parse_checksum_reply)
            .await?
        {
            Wait::Got(checksum) => checksum as i32,
            Wait::TimedOut => {
                warn!("No checksum report from {}", self.session.target);
                return Err(LoaderError::NoResponseAfterHandshake);
            }
            Wait::Cancelled => return Ok(Step::Cancelled),
        };

        if !self.checksum.verify_checksum(self.expected_checksum, actual) {
            warn!(
                "Checksum mismatch: expected {:#04x}, device reported {actual:#04x}",
                self.expected_checksum
            );
            self.events.send(LoadEvent::ChecksumFailure);
            return Err(LoaderError::ChecksumMismatch);
        }

        Ok(Step::Done)
    }

    /// Wait for a datagram from the target that `accept` recognises.
    ///
    /// Datagrams from other hosts, and ones `accept` rejects, are discarded.
    async fn wait_for<T, F>(&self, link: &Link, timeout: Duration, mut accept: F) -> Result<Wait<T>>
    where
        F: FnMut(&[u8]) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;
        let device_ip = IpAddr::V4(self.session.target.ip_address);

        loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Wait::Cancelled),
                packet = link.next_packet(deadline) => packet?,
            };
            let Some(packet) = packet else {
                return Ok(Wait::TimedOut);
            };

            if packet.sender.ip() != device_ip {
                debug!("Ignoring datagram from {}", packet.sender);
                continue;
            }
            if let Some(value) = accept(&packet.payload) {
                return Ok(Wait::Got(value));
            }
            trace!(
                "Ignoring {}-byte datagram while {:?}",
                packet.payload.len(),
                self.session.state
            );
        }
    }

    /// Sleep, returning `true` if cancelled meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = time::sleep(duration) => false,
        }
    }

    fn enter(&mut self, state: SessionState) {
        if self.session.state.is_terminal() {
            return;
        }
        self.session.state = state;
        let status = if state == SessionState::Resetting {
            let attempt = self.max_attempts - self.session.attempts_remaining + 1;
            format!("{state} (attempt {attempt} of {})", self.max_attempts)
        } else {
            state.to_string()
        };
        debug!("{}: {status}", self.session.target);
        self.events.status(status);
    }

    /// Report the transferred fraction. 1.0 is held back until the checksum is confirmed.
    fn report_progress(&mut self) {
        if self.session.bytes_sent >= self.session.total_bytes {
            return;
        }
        self.emit_progress(self.session.bytes_sent as f32 / self.session.total_bytes as f32);
    }

    /// Emit progress only when it moves forward, so retries never report a step backwards.
    fn emit_progress(&mut self, progress: f32) {
        if self.last_progress.is_some_and(|last| progress <= last) {
            return;
        }
        self.last_progress = Some(progress);
        self.events.send(LoadEvent::Progress(progress));
    }
}
