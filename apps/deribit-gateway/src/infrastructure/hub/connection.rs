//! Subscriber Connection
//!
//! Handle for one local subscriber: its lifecycle state, outbound update
//! queue, control frame channel, and the tokens that signal closing and
//! forced cancellation.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --handshake--> Open --disconnect/write error/shutdown--> Closing
//! Closing --queue drained or drain timeout--> Closed
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::ServerFrame;
use super::queue::{OutboundQueue, PushOutcome};
use crate::domain::streaming::Update;
use crate::domain::subscription::ConnectionId;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    /// WebSocket handshake in progress.
    Connecting = 0,
    /// Receiving subscriptions and updates.
    Open = 1,
    /// No new updates accepted; flushing the queue.
    Closing = 2,
    /// Gone.
    Closed = 3,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a control frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlSendError {
    /// The subscriber is not reading its control frames.
    #[error("control channel full")]
    Full,
    /// The writer has gone away.
    #[error("control channel closed")]
    Closed,
}

/// One subscriber connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    queue: OutboundQueue,
    control: mpsc::Sender<ServerFrame>,
    closing: CancellationToken,
    cancel: CancellationToken,
    accepted_at: Instant,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state and the receiving end of
    /// its control channel.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        queue_capacity: usize,
        control_capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (control, control_rx) = mpsc::channel(control_capacity.max(1));
        let handle = Self {
            id,
            peer,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            queue: OutboundQueue::new(queue_capacity),
            control,
            closing: CancellationToken::new(),
            cancel: CancellationToken::new(),
            accepted_at: Instant::now(),
        };
        (handle, control_rx)
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, if known.
    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Time since the connection was accepted.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.accepted_at.elapsed()
    }

    /// The outbound update queue.
    #[must_use]
    pub const fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Token cancelled once the connection leaves `Open`.
    ///
    /// The drain deadline runs from this moment.
    #[must_use]
    pub const fn closing_token(&self) -> &CancellationToken {
        &self.closing
    }

    /// Token cancelled when the connection must stop immediately.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `Connecting -> Open`. Returns false from any other state.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Connecting | Open -> Closing` and close the queue.
    ///
    /// Returns true for the caller that made the transition.
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.queue.close();
                    self.closing.cancel();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to `Closed` from any state.
    ///
    /// Returns true only for the first caller.
    pub fn mark_closed(&self) -> bool {
        self.queue.close();
        self.closing.cancel();
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        previous != ConnectionState::Closed as u8
    }

    /// Stop the connection's tasks without draining.
    pub fn force_close(&self) {
        self.begin_close();
        self.cancel.cancel();
    }

    /// Queue an update for delivery.
    pub fn enqueue(&self, update: Update) -> PushOutcome {
        if self.state() != ConnectionState::Open {
            return PushOutcome::Closed;
        }
        self.queue.push(update)
    }

    /// Queue a control frame. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the control channel is full or closed.
    pub fn send_control(&self, frame: ServerFrame) -> Result<(), ControlSendError> {
        self.control.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ControlSendError::Full,
            mpsc::error::TrySendError::Closed(_) => ControlSendError::Closed,
        })
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
