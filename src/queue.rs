//! Bounded per-connection outbound queue
//!
//! The dispatcher pushes frames without ever waiting; the connection's drain
//! task pulls them and writes to the transport. When the queue is full the
//! oldest frame is dropped and an overflow signal is recorded. Repeated
//! overflow episodes past the configured limit evict the connection.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::message::ServerMessage;

/// Why a connection left the `Open` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or the stream ended
    ClientClosed,
    /// No client activity within the idle timeout
    IdleTimeout,
    /// Malformed transport traffic
    ProtocolError,
    /// Overflow recurred past the tolerated limit
    SlowConsumer,
    /// Writing to the transport failed
    TransportFailure,
    /// Service is shutting down
    Shutdown,
}

impl CloseReason {
    /// Close frame to send to the client, if the transport is still usable
    pub fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::ClientClosed | CloseReason::TransportFailure => return None,
            CloseReason::IdleTimeout => (CloseCode::Normal, "idle timeout"),
            CloseReason::ProtocolError => (CloseCode::Protocol, "protocol error"),
            CloseReason::SlowConsumer => (CloseCode::Policy, "slow consumer"),
            CloseReason::Shutdown => (CloseCode::Away, "server shutting down"),
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::TransportFailure => "transport_failure",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Result of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued, nothing dropped
    Queued,
    /// Frame queued after dropping the oldest one
    Overflowed,
    /// Overflow recurred past the limit; the queue closed itself
    Evicted,
    /// Queue already closed, frame discarded
    Closed,
}

/// Next item for the drain task
#[derive(Debug)]
pub enum Delivery {
    /// `dropped` frames were lost since the last delivery
    Overflow { dropped: u64 },
    Frame(ServerMessage),
    /// Queue closed and fully drained
    Closed(CloseReason),
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<ServerMessage>,
    dropped_since_signal: u64,
    dropped_total: u64,
    overflow_episodes: u32,
    closed: Option<CloseReason>,
}

/// Bounded drop-oldest queue shared by the dispatcher and one drain task
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    overflow_limit: u32,
    state: Mutex<QueueState>,
    ready: Notify,
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames that evicts once
    /// overflow episodes exceed `overflow_limit`
    pub fn new(capacity: usize, overflow_limit: u32) -> Self {
        let (closed_tx, _) = watch::channel(None);
        Self {
            capacity: capacity.max(1),
            overflow_limit,
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            closed_tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a frame without waiting
    pub fn push(&self, frame: ServerMessage) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                if state.dropped_since_signal == 0 {
                    state.overflow_episodes += 1;
                }
                state.dropped_since_signal += 1;
                state.dropped_total += 1;
                outcome = PushOutcome::Overflowed;

                if state.overflow_episodes > self.overflow_limit {
                    // Everything still queued plus the incoming frame is lost
                    let lost = state.frames.len() as u64 + 1;
                    state.dropped_since_signal += lost;
                    state.dropped_total += lost;
                    state.frames.clear();
                    state.closed = Some(CloseReason::SlowConsumer);
                    outcome = PushOutcome::Evicted;
                }
            }

            if outcome != PushOutcome::Evicted {
                state.frames.push_back(frame);
            }
            outcome
        };

        if outcome == PushOutcome::Evicted {
            self.closed_tx.send_replace(Some(CloseReason::SlowConsumer));
        }
        self.ready.notify_one();
        outcome
    }

    /// Non-blocking read; `None` when nothing is ready and the queue is open
    pub fn try_next(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        if state.dropped_since_signal > 0 {
            let dropped = std::mem::take(&mut state.dropped_since_signal);
            return Some(Delivery::Overflow { dropped });
        }
        if let Some(frame) = state.frames.pop_front() {
            return Some(Delivery::Frame(frame));
        }
        state.closed.map(Delivery::Closed)
    }

    /// Wait for the next delivery
    ///
    /// Queued frames are still handed out after `close`, so a closing
    /// connection can flush before its drain task ends.
    pub async fn next(&self) -> Delivery {
        loop {
            if let Some(delivery) = self.try_next() {
                return delivery;
            }
            self.ready.notified().await;
        }
    }

    /// Stop accepting frames. Returns false if already closed; the first
    /// reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason);
        }
        self.closed_tx.send_replace(Some(reason));
        self.ready.notify_one();
        true
    }

    /// Resolves once the queue has been closed, with the close reason
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        reason.unwrap_or(CloseReason::Shutdown)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames dropped over the queue's lifetime
    pub fn dropped_total(&self) -> u64 {
        self.state.lock().dropped_total
    }

    pub fn overflow_episodes(&self) -> u32 {
        self.state.lock().overflow_episodes
    }
}
