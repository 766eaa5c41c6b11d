//! Loader tests against a simulated board on loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use super::protocol::{
    ack_packet, checksum_reply, handshake_reply, is_valid_handshake, is_verify, parse_chunk, parse_transfer_header,
};
use super::types::{BOOT_PROGRAM_EEPROM_RUN, BOOT_RUN_RAM, RESET_ASSERT, SessionState};
use super::*;
use crate::config::LoaderConfig;
use crate::device::DeviceRecord;
use crate::events::{LoadEvent, LoadOutcome};
use crate::xbee::protocol::{build_at_response, parse_at_command};
use crate::xbee::types::{AT_IO_OUTPUT, STATUS_OK};

/// How the simulated board misbehaves.
#[derive(Debug, Clone, Default)]
struct Script {
    /// Never answer the handshake.
    mute: bool,
    /// Report a wrong checksum for the first N verifications.
    bad_checksums: u32,
    /// Stop acknowledging after this many chunks of each attempt.
    ack_limit: Option<u32>,
    /// Delay before each acknowledgement.
    ack_delay: Duration,
}

#[derive(Debug, Default)]
struct Stats {
    resets: AtomicU32,
    handshakes: AtomicU32,
    verifies: AtomicU32,
    boot_command: Mutex<Option<u8>>,
    received: Mutex<Vec<u8>>,
    /// Where the last handshake came from.
    loader_addr: Mutex<Option<SocketAddr>>,
}

/// XBee module with a Propeller behind it, both services on 127.0.0.1.
struct FakeBoard {
    command_port: u16,
    serial_port: u16,
    stats: Arc<Stats>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeBoard {
    async fn start(script: Script) -> Self {
        let command = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let serial = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let command_port = command.local_addr().unwrap().port();
        let serial_port = serial.local_addr().unwrap().port();
        let stats = Arc::new(Stats::default());

        let tasks = vec![
            tokio::spawn(run_command_service(command, Arc::clone(&stats))),
            tokio::spawn(run_serial_service(serial, script, Arc::clone(&stats))),
        ];

        Self {
            command_port,
            serial_port,
            stats,
            tasks,
        }
    }

    fn device(&self) -> DeviceRecord {
        DeviceRecord::from_address(Ipv4Addr::LOCALHOST, self.serial_port)
    }

    fn loader(&self) -> Loader {
        Loader::new(self.command_port, test_config())
    }

    fn resets(&self) -> u32 {
        self.stats.resets.load(Ordering::SeqCst)
    }

    /// Panics unless the loader's socket port can be bound again, i.e. the socket is closed.
    fn assert_loader_socket_closed(&self) {
        let port = self
            .stats
            .loader_addr
            .lock()
            .unwrap()
            .expect("no handshake received")
            .port();
        std::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .unwrap_or_else(|e| panic!("loader socket on port {port} still open: {e}"));
    }
}

impl Drop for FakeBoard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_command_service(socket: UdpSocket, stats: Arc<Stats>) {
    let mut buf = [0u8; 2048];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Some((command, params)) = parse_at_command(&buf[..len]) else {
            continue;
        };
        if command == AT_IO_OUTPUT && params == RESET_ASSERT {
            stats.resets.fetch_add(1, Ordering::SeqCst);
        }
        let _ = socket.send_to(&build_at_response(command, STATUS_OK, &[]), from).await;
    }
}

async fn run_serial_service(socket: UdpSocket, script: Script, stats: Arc<Stats>) {
    let mut buf = [0u8; 2048];
    let mut image = Vec::new();
    let mut chunks_this_attempt = 0u32;

    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let payload = &buf[..len];

        if is_valid_handshake(payload) {
            stats.handshakes.fetch_add(1, Ordering::SeqCst);
            *stats.loader_addr.lock().unwrap() = Some(from);
            image.clear();
            chunks_this_attempt = 0;
            if !script.mute {
                let _ = socket.send_to(&handshake_reply(1), from).await;
            }
        } else if let Some((command, _total)) = parse_transfer_header(payload) {
            *stats.boot_command.lock().unwrap() = Some(command);
        } else if let Some((seq, offset, data)) = parse_chunk(payload) {
            if script.ack_limit.is_some_and(|limit| chunks_this_attempt >= limit) {
                continue;
            }
            chunks_this_attempt += 1;
            let offset = offset as usize;
            image.resize(offset, 0);
            image.extend_from_slice(data);
            if !script.ack_delay.is_zero() {
                tokio::time::sleep(script.ack_delay).await;
            }
            let _ = socket.send_to(&ack_packet(seq), from).await;
        } else if is_verify(payload) {
            let verifies = stats.verifies.fetch_add(1, Ordering::SeqCst) + 1;
            let mut checksum = PropellerChecksum.compute_checksum(&image) as u32;
            if verifies <= script.bad_checksums {
                checksum = (checksum + 1) & 0xFF;
            }
            *stats.received.lock().unwrap() = image.clone();
            let _ = socket.send_to(&checksum_reply(checksum), from).await;
        }
    }
}

fn test_config() -> LoaderConfig {
    LoaderConfig {
        max_attempts: 3,
        chunk_size: 100,
        reset_delay_ms: 5,
        handshake_timeout_ms: 100,
        ack_timeout_ms: 300,
        verify_timeout_ms: 200,
        eeprom_verify_timeout_ms: 300,
    }
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Read every event until the stream ends.
async fn collect(mut handle: LoadHandle) -> Vec<LoadEvent> {
    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(10), handle.next_event())
        .await
        .expect("load stalled")
    {
        events.push(event);
    }
    events
}

fn progress_values(events: &[LoadEvent]) -> Vec<f32> {
    events
        .iter()
        .filter_map(|e| match e {
            LoadEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

fn count(events: &[LoadEvent], pred: impl Fn(&LoadEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn assert_single_terminal(events: &[LoadEvent]) {
    assert_eq!(count(events, LoadEvent::is_terminal), 1, "events: {events:?}");
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_successful_load_progress_is_monotonic() {
    let board = FakeBoard::start(Script::default()).await;
    let loader = board.loader();
    let image = test_image(1000);

    let handle = loader.load(image.clone(), Destination::Ram, board.device(), 3).unwrap();
    let events = collect(handle).await;

    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(LoadEvent::Complete)));

    let progress = progress_values(&events);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress: {progress:?}");
    assert_eq!(progress.first(), Some(&0.0));
    assert_eq!(progress.last(), Some(&1.0));
    // 0.0, 0.1 .. 0.9 while sending, 1.0 after verification
    assert_eq!(progress.len(), 11);

    // 1.0 comes after the board's checksum report, right before Complete
    let last_progress = events
        .iter()
        .rposition(|e| matches!(e, LoadEvent::Progress(_)))
        .unwrap();
    assert!(
        events[last_progress + 1..]
            .iter()
            .all(|e| matches!(e, LoadEvent::Complete | LoadEvent::Status(_)))
    );

    assert_eq!(*board.stats.received.lock().unwrap(), image);
    assert_eq!(*board.stats.boot_command.lock().unwrap(), Some(BOOT_RUN_RAM));
    board.assert_loader_socket_closed();
    assert_eq!(board.resets(), 1);
    assert!(!loader.is_loading(&board.device()));
}

#[tokio::test]
async fn test_no_handshake_exhausts_attempts() {
    let board = FakeBoard::start(Script {
        mute: true,
        ..Default::default()
    })
    .await;

    let handle = board
        .loader()
        .load(test_image(400), Destination::Ram, board.device(), 3)
        .unwrap();
    let events = collect(handle).await;

    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(LoadEvent::Failed(LoaderError::NoResponseToReset))));
    board.assert_loader_socket_closed();
    assert_eq!(board.resets(), 3);
    assert_eq!(board.stats.handshakes.load(Ordering::SeqCst), 3);

    let remaining: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            LoadEvent::AttemptFailed { attempts_remaining } => Some(*attempts_remaining),
            _ => None,
        })
        .collect();
    assert_eq!(remaining, vec![2, 1, 0]);
    assert!(progress_values(&events).is_empty());
}

#[tokio::test]
async fn test_checksum_failures_then_success() {
    let board = FakeBoard::start(Script {
        bad_checksums: 2,
        ..Default::default()
    })
    .await;

    let handle = board
        .loader()
        .load(test_image(1000), Destination::Ram, board.device(), 3)
        .unwrap();
    let events = collect(handle).await;

    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(LoadEvent::Complete)));
    assert_eq!(count(&events, |e| matches!(e, LoadEvent::ChecksumFailure)), 2);
    assert_eq!(count(&events, |e| matches!(e, LoadEvent::Failed(_))), 0);
    assert_eq!(board.resets(), 3);

    let progress = progress_values(&events);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress: {progress:?}");
    assert_eq!(progress.last(), Some(&1.0));
}

#[tokio::test]
async fn test_checksum_failures_exhaust_attempts() {
    let board = FakeBoard::start(Script {
        bad_checksums: u32::MAX,
        ..Default::default()
    })
    .await;

    let handle = board
        .loader()
        .load(test_image(300), Destination::Ram, board.device(), 2)
        .unwrap();
    let events = collect(handle).await;

    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(LoadEvent::Failed(LoaderError::ChecksumMismatch))));
    assert_eq!(count(&events, |e| matches!(e, LoadEvent::ChecksumFailure)), 2);
    // Never claims completion
    assert!(!progress_values(&events).contains(&1.0));
}

#[tokio::test]
async fn test_silence_after_handshake() {
    let board = FakeBoard::start(Script {
        ack_limit: Some(3),
        ..Default::default()
    })
    .await;

    let handle = board
        .loader()
        .load(test_image(1000), Destination::Ram, board.device(), 2)
        .unwrap();
    let events = collect(handle).await;

    assert_single_terminal(&events);
    assert!(matches!(
        events.last(),
        Some(LoadEvent::Failed(LoaderError::NoResponseAfterHandshake))
    ));
    assert_eq!(board.resets(), 2);

    // The second attempt restarts from zero but reported progress never goes back
    let progress = progress_values(&events);
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "progress: {progress:?}");
    assert_eq!(progress.last(), Some(&0.3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_transfer() {
    let board = FakeBoard::start(Script {
        ack_delay: Duration::from_millis(100),
        ..Default::default()
    })
    .await;
    let loader = board.loader();
    let mut handle = loader
        .load(test_image(1000), Destination::Ram, board.device(), 3)
        .unwrap();

    // Wait until the transfer is under way
    loop {
        let event = timeout(Duration::from_secs(5), handle.next_event())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, LoadEvent::Progress(p) if p > 0.0) {
            break;
        }
    }

    let cancelled_at = Instant::now();
    handle.cancel();

    let mut rest = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), handle.next_event())
            .await
            .unwrap()
            .expect("stream ended without a terminal event");
        let terminal = event.is_terminal();
        rest.push(event);
        if terminal {
            break;
        }
    }

    // Socket and device are already released when the acknowledgement arrives
    board.assert_loader_socket_closed();
    assert!(!loader.is_loading(&board.device()));

    assert!(matches!(rest.last(), Some(LoadEvent::Cancelled)), "events: {rest:?}");
    assert!(progress_values(&rest).is_empty(), "events: {rest:?}");
    assert_eq!(count(&rest, |e| matches!(e, LoadEvent::Failed(_))), 0);
    // Observed within one protocol step, not after the ack timeout
    assert!(cancelled_at.elapsed() < Duration::from_millis(test_config().ack_timeout_ms));
    assert!(handle.next_event().await.is_none());
}

#[tokio::test]
async fn test_transport_error_is_fatal_immediately() {
    // Broadcast without SO_BROADCAST is refused by the OS on the first send
    let device = DeviceRecord::from_address(Ipv4Addr::BROADCAST, 9750);
    let loader = Loader::new(3054, test_config());

    let handle = loader.load(test_image(100), Destination::Ram, device, 3).unwrap();
    let events = collect(handle).await;

    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(LoadEvent::Failed(LoaderError::Transport(_)))));
    assert_eq!(count(&events, |e| matches!(e, LoadEvent::AttemptFailed { .. })), 0);
}

#[tokio::test]
async fn test_same_device_is_busy_other_device_is_not() {
    let board = FakeBoard::start(Script {
        ack_delay: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    let loader = board.loader();

    let first = loader
        .load(test_image(1000), Destination::Ram, board.device(), 1)
        .unwrap();
    assert!(loader.is_loading(&board.device()));

    let second = loader.load(test_image(10), Destination::Ram, board.device(), 1);
    assert!(matches!(second, Err(LoaderError::DeviceBusy)));

    // A clone shares the busy set
    let clone = loader.clone();
    assert!(matches!(
        clone.load(test_image(10), Destination::Ram, board.device(), 1),
        Err(LoaderError::DeviceBusy)
    ));

    let mut other = board.device();
    other.port = other.port.wrapping_add(1);
    let third = loader.load(test_image(10), Destination::Ram, other, 1).unwrap();

    third.cancel();
    first.cancel();
    assert!(matches!(third.wait().await, LoadOutcome::Cancelled));
    assert!(matches!(first.wait().await, LoadOutcome::Cancelled));
    assert!(!loader.is_loading(&board.device()));
}

#[tokio::test]
async fn test_device_reusable_after_completion() {
    let board = FakeBoard::start(Script::default()).await;
    let loader = board.loader();

    let outcome = loader
        .load(test_image(200), Destination::Ram, board.device(), 1)
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_complete());

    let outcome = loader
        .load(test_image(200), Destination::Eeprom, board.device(), 1)
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_complete());
    assert_eq!(*board.stats.boot_command.lock().unwrap(), Some(BOOT_PROGRAM_EEPROM_RUN));
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let loader = Loader::new(3054, test_config());
    let device = DeviceRecord::from_address(Ipv4Addr::LOCALHOST, 9750);

    assert!(matches!(
        loader.load(Vec::new(), Destination::Ram, device.clone(), 3),
        Err(LoaderError::InvalidRequest(_))
    ));
    assert!(matches!(
        loader.load(vec![1, 2, 3, 4], Destination::Ram, device.clone(), 0),
        Err(LoaderError::InvalidRequest(_))
    ));
    assert!(!loader.is_loading(&device));
}

#[tokio::test]
async fn test_custom_checksum_is_used() {
    /// Accepts any report.
    struct Lenient;
    impl Checksum for Lenient {
        fn compute_checksum(&self, _image: &[u8]) -> i32 {
            0
        }
        fn verify_checksum(&self, _expected: i32, _actual: i32) -> bool {
            true
        }
    }

    let board = FakeBoard::start(Script {
        bad_checksums: u32::MAX,
        ..Default::default()
    })
    .await;
    let loader = board.loader().with_checksum(Lenient);

    let handle = loader
        .load(test_image(300), Destination::Ram, board.device(), 1)
        .unwrap();
    assert!(handle.wait().await.is_complete());
}

#[test]
fn test_session_state_terminality() {
    assert!(SessionState::Complete.is_terminal());
    assert!(SessionState::FatalError.is_terminal());
    assert!(SessionState::Cancelled.is_terminal());
    assert!(!SessionState::Transferring.is_terminal());
    assert_eq!(SessionState::default(), SessionState::Idle);
}
