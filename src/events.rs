//! Notifications from a load session to its caller.
//!
//! Every session owns one channel. The caller reads it from a single task, so notifications
//! arrive in causal order in one place and need no further synchronization. Exactly one
//! terminal event ends the stream.

use tokio::sync::mpsc;

use crate::loader::LoaderError;

/// Something that happened during a load.
#[derive(Debug)]
pub enum LoadEvent {
    /// Human-readable description of the current step.
    Status(String),
    /// Fraction of the image confirmed so far, in `[0.0, 1.0]`, never decreasing.
    /// `1.0` is only reported once the checksum has been verified.
    Progress(f32),
    /// The board reported a checksum that did not match. The load may still succeed on a
    /// later attempt.
    ChecksumFailure,
    /// One reset cycle failed; `attempts_remaining` more are allowed.
    AttemptFailed { attempts_remaining: u32 },
    /// Terminal: the image was loaded and verified.
    Complete,
    /// Terminal: the load failed.
    Failed(LoaderError),
    /// Terminal: the caller cancelled the load.
    Cancelled,
}

impl LoadEvent {
    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_) | Self::Cancelled)
    }
}

/// Final result of a load.
#[derive(Debug)]
pub enum LoadOutcome {
    Complete,
    Failed(LoaderError),
    Cancelled,
}

impl LoadOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl From<LoadOutcome> for LoadEvent {
    fn from(outcome: LoadOutcome) -> Self {
        match outcome {
            LoadOutcome::Complete => Self::Complete,
            LoadOutcome::Failed(e) => Self::Failed(e),
            LoadOutcome::Cancelled => Self::Cancelled,
        }
    }
}

/// Sending side of a session's event channel.
///
/// Drops everything sent after the terminal event.
#[derive(Debug)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<LoadEvent>,
    finished: bool,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LoadEvent>) -> Self {
        Self { tx, finished: false }
    }

    pub(crate) fn send(&mut self, event: LoadEvent) {
        if self.finished {
            return;
        }
        if event.is_terminal() {
            self.finished = true;
        }
        // The caller may have dropped its handle; the session still runs to completion.
        let _ = self.tx.send(event);
    }

    pub(crate) fn status(&mut self, message: impl Into<String>) {
        self.send(LoadEvent::Status(message.into()));
    }

    pub(crate) fn finish(&mut self, outcome: LoadOutcome) {
        self.send(outcome.into());
    }
}
