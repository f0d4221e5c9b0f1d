// src/core/flush.rs

//! The outbound buffer and the throttled flush pipeline.
//!
//! At most one frame leaves the room per throttle interval. Presence
//! updates, broadcasts and storage ops accumulate in the buffer between
//! flushes and are composed into a single frame in a fixed order:
//! `[presence?, broadcasts…, update_storage?]`.

use crate::core::events::PendingEvents;
use crate::core::protocol::{ClientMessage, JsonObject, Op, encode_frame};
use crate::core::room::{BROADCAST_KEYFRAME, RoomCore};
use tracing::{debug, warn};

/// The queued outbound presence state: either a full keyframe or a patch.
#[derive(Debug, Clone)]
pub enum PresenceQueue {
    Full(JsonObject),
    Partial(JsonObject),
}

/// Everything waiting for the next flush.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    pub me: Option<PresenceQueue>,
    pub messages: Vec<ClientMessage>,
    pub storage_ops: Vec<Op>,
}

impl OutboundBuffer {
    /// Queues a full presence keyframe, superseding any queued patch.
    pub fn queue_full_presence(&mut self, data: JsonObject) {
        self.me = Some(PresenceQueue::Full(data));
    }

    /// Merges a presence patch into the queue. Merging into a queued
    /// keyframe keeps it a keyframe; `null` values there drop the key, while
    /// a plain patch keeps them as deletion markers for the receivers.
    pub fn merge_presence_patch(&mut self, patch: &JsonObject) {
        match &mut self.me {
            Some(PresenceQueue::Full(data)) => {
                for (key, value) in patch {
                    if value.is_null() {
                        data.shift_remove(key);
                    } else {
                        data.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(PresenceQueue::Partial(data)) => {
                for (key, value) in patch {
                    data.insert(key.clone(), value.clone());
                }
            }
            None => self.me = Some(PresenceQueue::Partial(patch.clone())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.me.is_none() && self.messages.is_empty() && self.storage_ops.is_empty()
    }
}

impl RoomCore {
    /// Pushes buffered work toward the wire, respecting the throttle.
    ///
    /// Storage ops always enter the unacknowledged ledger here, whether or
    /// not a frame can be sent: a closed channel drops them from the buffer
    /// but the ledger keeps them for the post-reconnect resend.
    pub(crate) fn try_flush(&mut self, pending: &mut PendingEvents) {
        for op in &self.buffer.storage_ops {
            self.ledger.insert(op.clone());
        }
        self.refresh_storage_status(pending);

        if self.outbound.is_none() {
            if !self.buffer.storage_ops.is_empty() {
                debug!(
                    "Channel closed; holding {} storage ops in the ledger",
                    self.buffer.storage_ops.len()
                );
            }
            self.buffer.storage_ops.clear();
            return;
        }

        let now = tokio::time::Instant::now();
        let elapsed = self
            .last_flush
            .map(|last| now.duration_since(last));
        match elapsed {
            Some(elapsed) if elapsed < self.throttle => {
                // Too soon. Coalesce with the already-armed timer if any.
                if self.flush_timer.is_none() {
                    self.arm_flush_timer(self.throttle - elapsed);
                }
            }
            _ => {
                let messages = self.compose_messages();
                if !messages.is_empty() {
                    self.send_frame(&messages);
                    self.last_flush = Some(now);
                }
            }
        }
    }

    /// Drains the buffer into an ordered message group.
    fn compose_messages(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        match self.buffer.me.take() {
            Some(PresenceQueue::Full(data)) => messages.push(ClientMessage::UpdatePresence {
                data,
                target_actor: Some(BROADCAST_KEYFRAME),
            }),
            Some(PresenceQueue::Partial(data)) => messages.push(ClientMessage::UpdatePresence {
                data,
                target_actor: None,
            }),
            None => {}
        }
        messages.append(&mut self.buffer.messages);
        let ops = std::mem::take(&mut self.buffer.storage_ops);
        if !ops.is_empty() {
            messages.push(ClientMessage::UpdateStorage { ops });
        }
        messages
    }

    pub(crate) fn send_frame(&mut self, messages: &[ClientMessage]) {
        let frame = encode_frame(messages);
        match &self.outbound {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    warn!("Outbound channel is gone; dropping frame");
                    self.outbound = None;
                }
            }
            None => warn!("Tried to send a frame without an open channel"),
        }
    }

    /// Arms the one-shot flush timer. There is at most one; the handle of a
    /// fired or aborted timer is cleared before a new one is armed.
    fn arm_flush_timer(&mut self, delay: std::time::Duration) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let runtime = shared.runtime.clone();
        self.flush_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.flush_tick();
        }));
    }

    pub(crate) fn abort_flush_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}
