//! Fan-out of encoded envelopes to every subscriber of a room.
//!
//! ```text
//!                    ┌──────────────┐
//!   commit ───────▶  │ RoomChannel  │ ──▶ rx (alice)
//!   presence ─────▶  │  (broadcast) │ ──▶ rx (bob)
//!   cursor ───────▶  │              │ ──▶ rx (carol)
//!                    └──────────────┘
//! ```
//!
//! Envelopes are encoded once and shared as `Arc<Vec<u8>>`, so a room
//! with a hundred subscribers costs one serialization per send. Every
//! subscriber receives every envelope, the sender's own included; a
//! client treats its echo as the commit acknowledgement. Slow
//! subscribers lag rather than block the room, and a lagged receiver
//! observes how many envelopes it missed.
//!
//! The roster of who is in the room is presence's job, not the
//! channel's.
//!
//! Reference: Kleppmann, Chapter 11 — Messaging Systems

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{Envelope, ProtocolError};

/// Snapshot of channel health for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub envelopes_sent: u64,
    /// Sends that reached no subscriber at all.
    pub envelopes_dropped: u64,
    pub subscribers: usize,
}

/// One room's fan-out channel.
///
/// Cheap to clone the receivers off of; the channel itself lives in
/// the room for as long as the room does.
pub struct RoomChannel {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    envelopes_sent: AtomicU64,
    envelopes_dropped: AtomicU64,
}

impl RoomChannel {
    /// `capacity` is the per-subscriber buffer; a subscriber further
    /// behind than that starts missing envelopes.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            envelopes_sent: AtomicU64::new(0),
            envelopes_dropped: AtomicU64::new(0),
        }
    }

    /// Attach a new subscriber. The receiver only sees envelopes sent
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Encode and fan out one envelope. Returns how many subscribers
    /// it reached.
    pub fn send(&self, envelope: &Envelope) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(envelope.encode()?);
        Ok(self.fan_out(encoded))
    }

    /// Fan out pre-encoded bytes. Lock-free; stats via atomics.
    pub fn fan_out(&self, encoded: Arc<Vec<u8>>) -> usize {
        match self.sender.send(encoded) {
            Ok(reached) => {
                self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
                reached
            }
            Err(_) => {
                // Nobody listening.
                self.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
