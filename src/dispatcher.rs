//! Broadcast dispatcher
//!
//! Fans a channel event out to every connection subscribed at the time of
//! the call. Pushes never wait: backpressure stays local to each
//! connection's outbound queue.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::message::{BroadcastEvent, ServerMessage};
use crate::queue::PushOutcome;
use crate::registry::Registry;

/// Per-call delivery tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers in the snapshot
    pub targeted: usize,
    /// Frames enqueued (including those that displaced an older frame)
    pub enqueued: usize,
    /// Enqueues that dropped an older frame
    pub overflowed: usize,
    /// Subscribers evicted by this call for recurring overflow
    pub evicted: usize,
    /// Subscribers whose queue was already closed
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Enqueue `event` on every current subscriber of its channel.
    ///
    /// A channel without subscribers is a no-op.
    pub fn broadcast(&self, event: Arc<BroadcastEvent>) -> DispatchReport {
        let subscribers = self.registry.subscribers_of(&event.channel_id);
        let mut report = DispatchReport {
            targeted: subscribers.len(),
            ..DispatchReport::default()
        };
        if subscribers.is_empty() {
            debug!(
                channel_id = %event.channel_id,
                sequence = event.sequence,
                "No subscribers, broadcast skipped"
            );
            return report;
        }

        let frame = ServerMessage::Event(event.clone());
        for subscriber in &subscribers {
            match subscriber.queue.push(frame.clone()) {
                PushOutcome::Queued => report.enqueued += 1,
                PushOutcome::Overflowed => {
                    report.enqueued += 1;
                    report.overflowed += 1;
                    warn!(
                        connection_id = %subscriber.connection_id,
                        channel_id = %event.channel_id,
                        "Outbound queue full, oldest event dropped"
                    );
                }
                PushOutcome::Evicted => {
                    report.evicted += 1;
                    warn!(
                        connection_id = %subscriber.connection_id,
                        channel_id = %event.channel_id,
                        dropped = subscriber.queue.dropped_total(),
                        "Slow consumer evicted"
                    );
                }
                PushOutcome::Closed => report.skipped += 1,
            }
        }

        debug!(
            channel_id = %event.channel_id,
            sequence = event.sequence,
            kind = %event.event_kind,
            targeted = report.targeted,
            enqueued = report.enqueued,
            "Broadcast dispatched"
        );
        report
    }
}
