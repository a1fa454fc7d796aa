//! Message ingestion bridge
//!
//! The only entry point for the persistence/REST layer. Callers have already
//! committed the change; the bridge stamps the next per-channel sequence
//! number and hands the event to the dispatcher. Nothing here can fail the
//! caller.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::membership::MembershipDelta;
use crate::message::{BroadcastEvent, EventKind};
use crate::store::StoredMessage;
use crate::types::ChannelId;

#[derive(Debug)]
pub struct MessageBridge {
    dispatcher: Dispatcher,
    /// Last sequence handed out per channel; the mutex is the channel's
    /// single sequencing authority.
    sequences: DashMap<ChannelId, Arc<Mutex<u64>>>,
}

impl MessageBridge {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            sequences: DashMap::new(),
        }
    }

    /// Broadcast a committed change. Returns the sequence number assigned.
    pub fn notify_message_event(
        &self,
        channel_id: ChannelId,
        event_kind: EventKind,
        payload: serde_json::Value,
    ) -> u64 {
        let (sequence, report) =
            self.sequence_and_dispatch(channel_id.clone(), event_kind, payload);
        debug!(
            channel_id = %channel_id,
            kind = %event_kind,
            sequence,
            enqueued = report.enqueued,
            "Message event ingested"
        );
        sequence
    }

    /// Broadcast a stored message under `event_kind`. `None` if the message
    /// could not be encoded; the stored record is unaffected either way.
    pub fn notify_stored_message(
        &self,
        event_kind: EventKind,
        message: &StoredMessage,
    ) -> Option<u64> {
        match serde_json::to_value(message) {
            Ok(payload) => Some(self.notify_message_event(
                message.channel_id.clone(),
                event_kind,
                payload,
            )),
            Err(e) => {
                error!(message_id = message.id, error = %e, "Failed to encode stored message");
                None
            }
        }
    }

    /// Broadcast a `membership-changed` event for `channel_id`
    pub fn notify_membership_change(
        &self,
        channel_id: ChannelId,
        delta: &MembershipDelta,
    ) -> Option<u64> {
        match serde_json::to_value(delta) {
            Ok(payload) => Some(self.notify_message_event(
                channel_id,
                EventKind::MembershipChanged,
                payload,
            )),
            Err(e) => {
                error!(channel_id = %channel_id, error = %e, "Failed to encode membership delta");
                None
            }
        }
    }

    /// Last sequence number assigned on a channel, 0 if none yet
    pub fn last_sequence(&self, channel_id: &ChannelId) -> u64 {
        self.sequences
            .get(channel_id)
            .map(|sequence| *sequence.value().lock())
            .unwrap_or(0)
    }

    fn sequence_and_dispatch(
        &self,
        channel_id: ChannelId,
        event_kind: EventKind,
        payload: serde_json::Value,
    ) -> (u64, DispatchReport) {
        let sequencer = self
            .sequences
            .entry(channel_id.clone())
            .or_default()
            .value()
            .clone();

        // Held across the enqueue so same-channel events reach every queue
        // in sequence order. Enqueueing is memory-only.
        let mut last = sequencer.lock();
        *last += 1;
        let event = Arc::new(BroadcastEvent {
            event_kind,
            channel_id,
            sequence: *last,
            payload,
            timestamp: Utc::now(),
        });
        let report = self.dispatcher.broadcast(event);
        (*last, report)
    }
}
