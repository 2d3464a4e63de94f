//! Packet Monitor
//!
//! Surfaces every relayed, held and released packet as a `PacketEvent`: logged
//! under the `packetholder::packets` target and broadcast to subscribers such
//! as the management API event stream.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::info;

use crate::holding::{decode_permissive, Direction};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What happened to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Forwarded as soon as it arrived
    PassThrough,
    /// Withheld from the upstream server
    Holding,
    /// Previously held, now delivered upstream
    Delayed,
}

impl PacketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::PassThrough => "pass_through",
            PacketKind::Holding => "holding",
            PacketKind::Delayed => "delayed",
        }
    }

    /// Pass-through traffic can be muted, hold/release events cannot
    pub fn is_hold_event(self) -> bool {
        !matches!(self, PacketKind::PassThrough)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PacketKind::PassThrough => "PassThr",
            PacketKind::Holding => "Holding",
            PacketKind::Delayed => "Delayed",
        };
        write!(f, "{}", label)
    }
}

/// One observed packet
#[derive(Debug, Clone, Serialize)]
pub struct PacketEvent {
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub kind: PacketKind,
    pub rule_index: Option<usize>,
    pub size: usize,
    pub text: String,
}

/// Observability sink with the "only held packets" switch
#[derive(Debug)]
pub struct PacketMonitor {
    only_held: AtomicBool,
    events: broadcast::Sender<PacketEvent>,
}

impl Default for PacketMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PacketMonitor {
    pub fn new(only_held: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            only_held: AtomicBool::new(only_held),
            events,
        }
    }

    /// Toggle whether pass-through traffic is reported
    pub fn set_only_held(&self, only_held: bool) {
        self.only_held.store(only_held, Ordering::Relaxed);
        info!(
            "Packet output: {}",
            if only_held {
                "held and released packets only"
            } else {
                "all packets"
            }
        );
    }

    pub fn only_held(&self) -> bool {
        self.only_held.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PacketEvent> {
        self.events.subscribe()
    }

    /// Report a packet; returns false when the event was muted
    pub fn emit(
        &self,
        direction: Direction,
        kind: PacketKind,
        rule_index: Option<usize>,
        payload: &[u8],
    ) -> bool {
        if !kind.is_hold_event() && self.only_held() {
            return false;
        }

        let text = decode_permissive(payload).into_owned();
        info!(
            target: "packetholder::packets",
            direction = ?direction,
            kind = kind.as_str(),
            rule = rule_index,
            size = payload.len(),
            "[{:^7}][{}]: {}",
            direction.label(),
            kind,
            text
        );

        // No subscribers is fine
        let _ = self.events.send(PacketEvent {
            timestamp: SystemTime::now(),
            direction,
            kind,
            rule_index,
            size: payload.len(),
            text,
        });
        true
    }
}
