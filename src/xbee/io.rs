//! UDP socket I/O: a receive task feeding a [`PacketBuffer`], and timeout-bounded reads from it.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace};

use super::types::MAX_DATAGRAM;
use crate::buffer::{InboundPacket, PacketBuffer};

/// State shared between the receive task and the protocol side.
#[derive(Debug, Default)]
struct Inbox {
    buffer: PacketBuffer,
    notify: Notify,
    failure: Mutex<Option<io::Error>>,
}

impl Inbox {
    fn fail(&self, err: io::Error) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
        self.notify.notify_one();
    }

    fn take_failure(&self) -> Option<io::Error> {
        self.failure.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// A bound UDP socket whose datagrams are collected by a background task.
///
/// Dropping the link aborts the receive task and closes the socket.
pub(crate) struct Link {
    socket: Arc<UdpSocket>,
    inbox: Arc<Inbox>,
    receiver: JoinHandle<()>,
}

impl Link {
    /// Bind to `addr` and start receiving.
    pub(crate) async fn bind(addr: SocketAddr, broadcast: bool) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        let socket = Arc::new(socket);
        let inbox = Arc::new(Inbox::default());

        debug!("UDP link bound to {}", socket.local_addr()?);

        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&inbox)));

        Ok(Self {
            socket,
            inbox,
            receiver,
        })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram.
    pub(crate) async fn send_to(&self, packet: &[u8], target: SocketAddr) -> io::Result<()> {
        trace!(
            "TX {} bytes to {target}: {:02X?}",
            packet.len(),
            &packet[..packet.len().min(16)]
        );
        let sent = self.socket.send_to(packet, target).await?;
        if sent != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", packet.len()),
            ));
        }
        Ok(())
    }

    /// Discard everything received so far.
    pub(crate) fn flush(&self) -> usize {
        self.inbox.buffer.clear()
    }

    /// Next datagram in arrival order, waiting until `deadline` at most.
    ///
    /// `Ok(None)` means the deadline passed with nothing received. An error means the socket
    /// failed and the link is unusable.
    pub(crate) async fn next_packet(&self, deadline: Instant) -> io::Result<Option<InboundPacket>> {
        loop {
            if let Some(packet) = self.inbox.buffer.pull() {
                return Ok(Some(packet));
            }
            if let Some(err) = self.inbox.take_failure() {
                return Err(err);
            }
            if self.receiver.is_finished() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "UDP receive task stopped"));
            }

            tokio::select! {
                _ = self.inbox.notify.notified() => {}
                _ = time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

impl Link {
    /// Stop the receive task and close the socket before returning.
    pub(crate) async fn close(mut self) {
        self.receiver.abort();
        // The task's socket handle is released once the abort completes.
        match (&mut self.receiver).await {
            Err(e) if !e.is_cancelled() => error!("UDP receive task failed: {e}"),
            _ => {}
        }
    }

    /// Make the next read fail as if the socket had.
    #[cfg(test)]
    pub(crate) fn inject_failure(&self, err: io::Error) {
        self.inbox.fail(err);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, inbox: Arc<Inbox>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, sender)) => {
                trace!("RX {len} bytes from {sender}");
                inbox.buffer.push(buf[..len].to_vec(), sender, std::time::Instant::now());
                inbox.notify.notify_one();
            }
            // ICMP port-unreachable for an earlier send; the socket itself is fine.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!("Ignoring connection reset on UDP socket");
            }
            Err(e) => {
                error!("UDP receive failed: {e}");
                inbox.fail(e);
                return;
            }
        }
    }
}
