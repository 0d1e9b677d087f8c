//! Active-message envelopes, encoding, and dispatch.
//!
//! Nodes exchange short typed messages: barrier arrivals and
//! adjustments flow to the owner, publication notifications and event
//! triggers flow back out, and shutdown is an all-to-all broadcast.
//! Envelopes are MessagePack-encoded and carry a per-link sequence
//! number; links deliver at least once in FIFO per-sender order, so a
//! per-sender high-water mark makes duplicate suppression exact.
//!
//! Handlers are pure state mutators plus continuations: they run on the
//! poller thread and must never block on user events.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::RuntimeCore;
use crate::types::{Generation, Id, NodeId};
use crate::{barrier, event, runtime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A routed message with its link-level sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub sender: NodeId,
    pub seq: u64,
    pub body: MessageBody,
}

/// The message kinds carried between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    /// An arrival (with optional reduction value) forwarded to the
    /// barrier's owner.
    BarrierArrival {
        barrier: Id,
        creator_gen: u32,
        gen: Generation,
        count: u64,
        value: Option<Vec<u8>>,
        poisoned: bool,
    },
    /// A published result fanned out to subscribers.
    BarrierNotify {
        barrier: Id,
        gen: Generation,
        value: Vec<u8>,
        poisoned: bool,
    },
    /// A request to be notified when a generation publishes.
    BarrierResultSubscribe { barrier: Id, gen: Generation },
    /// A request to be notified when an event generation triggers.
    EventSubscribe { event: Id, gen: Generation },
    /// A trigger notification from an event's owner.
    EventTrigger {
        event: Id,
        gen: Generation,
        poisoned: bool,
    },
    /// Shutdown broadcast; every node echoes it exactly once.
    RuntimeShutdown { initiating_node: NodeId },
    /// An arrival-count adjustment forwarded to the barrier's owner.
    BarrierAdjust {
        barrier: Id,
        creator_gen: u32,
        gen: Generation,
        delta: i64,
    },
}

impl MessageBody {
    /// The stable wire id of this message kind.
    pub(crate) const fn msg_id(&self) -> u8 {
        match self {
            Self::BarrierArrival { .. } => 1,
            Self::BarrierNotify { .. } => 2,
            Self::BarrierResultSubscribe { .. } => 3,
            Self::EventSubscribe { .. } => 4,
            Self::EventTrigger { .. } => 5,
            Self::RuntimeShutdown { .. } => 6,
            Self::BarrierAdjust { .. } => 7,
        }
    }
}

impl Envelope {
    /// Encodes the envelope for the wire.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|err| {
            Error::new(ErrorKind::TransportFailure)
                .with_context("envelope encoding failed")
                .with_source(err)
        })
    }

    /// Decodes an envelope received from the wire.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|err| {
            Error::new(ErrorKind::TransportFailure)
                .with_context("envelope decoding failed")
                .with_source(err)
        })
    }
}

/// Per-sender duplicate suppression.
///
/// Links are FIFO per sender, so any sequence number at or below the
/// high-water mark has already been applied.
#[derive(Debug, Default)]
pub(crate) struct Deduper {
    seen: Mutex<HashMap<NodeId, u64>>,
}

impl Deduper {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns true if the envelope is fresh and records it.
    pub(crate) fn accept(&self, sender: NodeId, seq: u64) -> bool {
        let mut seen = self.seen.lock().expect("deduper lock poisoned");
        let mark = seen.entry(sender).or_insert(0);
        if seq <= *mark {
            false
        } else {
            *mark = seq;
            true
        }
    }
}

/// Applies one incoming envelope to local state.
///
/// Duplicate envelopes are dropped; handler errors are logged rather
/// than propagated so one bad message cannot wedge the poller.
pub(crate) fn dispatch(rt: &RuntimeCore, envelope: Envelope) {
    if !rt.deduper().accept(envelope.sender, envelope.seq) {
        tracing::trace!(
            sender = %envelope.sender,
            seq = envelope.seq,
            msg_id = envelope.body.msg_id(),
            "duplicate message dropped"
        );
        return;
    }
    let msg_id = envelope.body.msg_id();
    let sender = envelope.sender;
    let result = match envelope.body {
        MessageBody::BarrierArrival {
            barrier,
            creator_gen,
            gen,
            count,
            value,
            poisoned,
        } => rt.barrier_impl(barrier).and_then(|imp| {
            barrier::apply_arrival(rt, &imp, creator_gen, gen, count, value.as_deref(), poisoned)
        }),
        MessageBody::BarrierNotify {
            barrier,
            gen,
            value,
            poisoned,
        } => barrier::handle_notify(rt, barrier, gen, value, poisoned),
        MessageBody::BarrierResultSubscribe { barrier, gen } => {
            barrier::handle_result_subscribe(rt, barrier, gen, sender)
        }
        MessageBody::EventSubscribe { event, gen } => {
            event::handle_subscribe(rt, event, gen, sender)
        }
        MessageBody::EventTrigger {
            event,
            gen,
            poisoned,
        } => event::handle_trigger(rt, event, gen, poisoned),
        MessageBody::RuntimeShutdown { initiating_node } => {
            runtime::handle_shutdown_message(rt, initiating_node, sender);
            Ok(())
        }
        MessageBody::BarrierAdjust {
            barrier,
            creator_gen,
            gen,
            delta,
        } => rt
            .barrier_impl(barrier)
            .and_then(|imp| barrier::apply_adjust(rt, &imp, creator_gen, gen, delta)),
    };
    if let Err(err) = result {
        if err.is_stale() {
            tracing::warn!(%err, %sender, msg_id, "message for a stale handle dropped");
        } else {
            tracing::error!(%err, %sender, msg_id, "message handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdKind;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            sender: NodeId(3),
            seq: 17,
            body: MessageBody::BarrierArrival {
                barrier: Id::new(IdKind::Barrier, NodeId(0), 5),
                creator_gen: 2,
                gen: 4,
                count: 1,
                value: Some(vec![1, 2, 3, 4]),
                poisoned: false,
            },
        };
        let bytes = envelope.encode().expect("encode failed");
        let decoded = Envelope::decode(&bytes).expect("decode failed");
        assert_eq!(decoded.sender, NodeId(3));
        assert_eq!(decoded.seq, 17);
        assert_eq!(decoded.body.msg_id(), 1);
        match decoded.body {
            MessageBody::BarrierArrival {
                barrier,
                gen,
                count,
                value,
                ..
            } => {
                assert_eq!(barrier, Id::new(IdKind::Barrier, NodeId(0), 5));
                assert_eq!(gen, 4);
                assert_eq!(count, 1);
                assert_eq!(value, Some(vec![1, 2, 3, 4]));
            }
            other => unreachable!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Envelope::decode(&[0xC1, 0xFF, 0x00]).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
    }

    #[test]
    fn msg_ids_are_stable() {
        let shutdown = MessageBody::RuntimeShutdown {
            initiating_node: NodeId(0),
        };
        assert_eq!(shutdown.msg_id(), 6);
        let subscribe = MessageBody::EventSubscribe {
            event: Id::new(IdKind::Event, NodeId(1), 2),
            gen: 1,
        };
        assert_eq!(subscribe.msg_id(), 4);
    }

    #[test]
    fn deduper_drops_replays() {
        let deduper = Deduper::new();
        assert!(deduper.accept(NodeId(1), 1));
        assert!(deduper.accept(NodeId(1), 2));
        assert!(!deduper.accept(NodeId(1), 2));
        assert!(!deduper.accept(NodeId(1), 1));
        // Independent per sender.
        assert!(deduper.accept(NodeId(2), 1));
        assert!(deduper.accept(NodeId(1), 3));
    }
}
