//! Pending Queue
//!
//! FIFO store of withheld client packets shared by both relay loops. Every
//! operation takes the single queue lock for its whole duration and never
//! awaits while holding it.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{decode_permissive, Direction, HoldingRule};

/// A withheld client packet tagged with the rule that held it
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub payload: Bytes,
    pub rule: Arc<HoldingRule>,
    pub held_at: Instant,
}

impl PendingPacket {
    pub fn new(payload: Bytes, rule: Arc<HoldingRule>) -> Self {
        Self {
            payload,
            rule,
            held_at: Instant::now(),
        }
    }
}

/// Mutex-protected ordered container of pending packets
#[derive(Debug, Default)]
pub struct PendingQueue {
    packets: Mutex<VecDeque<PendingPacket>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingPacket>> {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a packet to the tail of the queue
    pub fn enqueue(&self, payload: Bytes, rule: Arc<HoldingRule>) {
        self.lock().push_back(PendingPacket::new(payload, rule));
    }

    /// Remove and return every packet whose rule is released by `observed`
    ///
    /// Released packets keep their insertion order and so do the packets that
    /// stay queued.
    pub fn drain_matching(&self, direction: Direction, observed: &[u8]) -> Vec<PendingPacket> {
        let text = decode_permissive(observed);
        let mut queue = self.lock();
        if queue.is_empty() {
            return Vec::new();
        }

        let (released, remaining): (Vec<_>, Vec<_>) = queue
            .drain(..)
            .partition(|packet| packet.rule.matches_release(direction, &text));
        *queue = remaining.into();
        released
    }

    /// Remove and return every queued packet in insertion order
    pub fn drain_all(&self) -> Vec<PendingPacket> {
        self.lock().drain(..).collect()
    }

    /// How long the packet at the head of the queue has been held
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lock().front().map(|packet| packet.held_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holding::{ReleaseType, RuleOrigin};

    fn rule(index: usize, release_type: ReleaseType, release_keyword: &str) -> Arc<HoldingRule> {
        Arc::new(
            HoldingRule::new(
                index,
                RuleOrigin::Indexed,
                "hold",
                release_type,
                release_keyword,
                true,
            )
            .unwrap(),
        )
    }

    fn payloads(packets: &[PendingPacket]) -> Vec<&[u8]> {
        packets.iter().map(|p| p.payload.as_ref()).collect()
    }

    #[test]
    fn test_drain_all_is_fifo() {
        let queue = PendingQueue::new();
        let r = rule(0, ReleaseType::None, "");
        for payload in ["a", "b", "c"] {
            queue.enqueue(Bytes::from(payload), Arc::clone(&r));
        }

        let drained = queue.drain_all();
        assert_eq!(payloads(&drained), vec![&b"a"[..], b"b", b"c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_all_on_empty_queue() {
        let queue = PendingQueue::new();
        assert!(queue.drain_all().is_empty());
        assert!(queue.drain_matching(Direction::ClientToServer, b"x").is_empty());
    }

    #[test]
    fn test_drain_matching_partitions_and_preserves_order() {
        let queue = PendingQueue::new();
        let by_client = rule(0, ReleaseType::FromClient, "go");
        let by_server = rule(1, ReleaseType::FromServer, "go");

        queue.enqueue(Bytes::from("c1"), Arc::clone(&by_client));
        queue.enqueue(Bytes::from("s1"), Arc::clone(&by_server));
        queue.enqueue(Bytes::from("c2"), Arc::clone(&by_client));
        queue.enqueue(Bytes::from("s2"), Arc::clone(&by_server));

        let released = queue.drain_matching(Direction::ClientToServer, b"let's go");
        assert_eq!(payloads(&released), vec![&b"c1"[..], b"c2"]);
        assert_eq!(queue.len(), 2);

        let released = queue.drain_matching(Direction::ServerToClient, b"go");
        assert_eq!(payloads(&released), vec![&b"s1"[..], b"s2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oldest_age_tracks_queue_head() {
        let queue = PendingQueue::new();
        assert!(queue.oldest_age().is_none());

        let r = rule(0, ReleaseType::FromClient, "go");
        queue.enqueue(Bytes::from("first"), Arc::clone(&r));
        std::thread::sleep(Duration::from_millis(20));
        queue.enqueue(Bytes::from("second"), Arc::clone(&r));
        assert!(queue.oldest_age().unwrap() >= Duration::from_millis(20));

        queue.drain_matching(Direction::ClientToServer, b"go");
        assert!(queue.oldest_age().is_none());
    }

    #[test]
    fn test_non_matching_keyword_keeps_packets() {
        let queue = PendingQueue::new();
        queue.enqueue(Bytes::from("333"), rule(0, ReleaseType::FromClient, "222"));

        assert!(queue.drain_matching(Direction::ClientToServer, b"111").is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_manual_only_rule_survives_release_checks() {
        let queue = PendingQueue::new();
        queue.enqueue(Bytes::from("333"), rule(0, ReleaseType::None, ""));

        assert!(queue.drain_matching(Direction::ClientToServer, b"").is_empty());
        assert!(queue.drain_matching(Direction::ServerToClient, b"").is_empty());
        assert_eq!(queue.drain_all().len(), 1);
    }

    #[test]
    fn test_concurrent_enqueue_keeps_every_packet() {
        let queue = Arc::new(PendingQueue::new());
        let r = rule(0, ReleaseType::None, "");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue.enqueue(Bytes::from(format!("{}-{}", t, i)), Arc::clone(&r));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 400);

        // Per-producer order is preserved
        for t in 0..4 {
            let prefix = format!("{}-", t);
            let seq: Vec<usize> = drained
                .iter()
                .filter_map(|p| std::str::from_utf8(&p.payload).ok())
                .filter_map(|s| s.strip_prefix(prefix.as_str()))
                .filter_map(|n| n.parse().ok())
                .collect();
            assert_eq!(seq, (0..100).collect::<Vec<_>>());
        }
    }
}
