//! Bounded per-stream packet intake
//!
//! When the decoder falls behind the queue keeps keyframes in preference to
//! delta frames: a keyframe arriving at a full queue evicts the oldest delta
//! frame, a delta frame arriving at a full queue is dropped.

use crate::decoder::Packet;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// What happened to a pushed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting an older packet
    Evicted,
    /// Queue full, packet discarded
    Dropped,
    /// Input already ended
    Closed,
}

#[derive(Debug)]
pub enum PopResult {
    Packet(Packet),
    /// Nothing arrived before the timeout
    Empty,
    /// Input ended and everything queued has been handed out
    Closed,
}

struct QueueInner {
    packets: VecDeque<Packet>,
    closed: bool,
    dropped: u64,
}

pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                packets: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, packet: Packet) -> PushOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        if inner.packets.len() < self.capacity {
            inner.packets.push_back(packet);
            self.cond.notify_one();
            return PushOutcome::Queued;
        }

        inner.dropped += 1;
        if !packet.is_keyframe {
            log::debug!("Packet queue full, dropping delta frame pts={}", packet.pts);
            return PushOutcome::Dropped;
        }

        match inner.packets.iter().position(|p| !p.is_keyframe) {
            Some(idx) => {
                inner.packets.remove(idx);
            }
            None => {
                inner.packets.pop_front();
            }
        }
        log::debug!("Packet queue full, evicted a packet for keyframe pts={}", packet.pts);
        inner.packets.push_back(packet);
        self.cond.notify_one();
        PushOutcome::Evicted
    }

    /// Wait up to `timeout` for the next packet
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        let mut inner = self.inner.lock();
        if inner.packets.is_empty() && !inner.closed {
            self.cond.wait_for(&mut inner, timeout);
        }
        match inner.packets.pop_front() {
            Some(packet) => PopResult::Packet(packet),
            None if inner.closed => PopResult::Closed,
            None => PopResult::Empty,
        }
    }

    /// End of input. Queued packets are still handed out.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    /// Wake any waiting consumer without changing the queue
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Packets discarded or evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn packet(pts: i64, key: bool) -> Packet {
        Packet::new(vec![0u8; 4], pts, key)
    }

    fn drain(queue: &PacketQueue) -> Vec<i64> {
        let mut out = Vec::new();
        while let PopResult::Packet(p) = queue.pop_timeout(Duration::ZERO) {
            out.push(p.pts);
        }
        out
    }

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new(4);
        for pts in 0..3 {
            assert_eq!(queue.push(packet(pts, pts == 0)), PushOutcome::Queued);
        }
        assert_eq!(drain(&queue), vec![0, 1, 2]);
    }

    #[test]
    fn test_full_queue_drops_delta_frames() {
        let queue = PacketQueue::new(2);
        queue.push(packet(0, true));
        queue.push(packet(1, false));
        assert_eq!(queue.push(packet(2, false)), PushOutcome::Dropped);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain(&queue), vec![0, 1]);
    }

    #[test]
    fn test_keyframe_evicts_oldest_delta() {
        let queue = PacketQueue::new(3);
        queue.push(packet(0, true));
        queue.push(packet(1, false));
        queue.push(packet(2, false));
        assert_eq!(queue.push(packet(3, true)), PushOutcome::Evicted);
        assert_eq!(drain(&queue), vec![0, 2, 3]);
    }

    #[test]
    fn test_keyframe_evicts_oldest_when_all_keyframes() {
        let queue = PacketQueue::new(2);
        queue.push(packet(0, true));
        queue.push(packet(1, true));
        assert_eq!(queue.push(packet(2, true)), PushOutcome::Evicted);
        assert_eq!(drain(&queue), vec![1, 2]);
    }

    #[test]
    fn test_close_delivers_remaining_then_reports_closed() {
        let queue = PacketQueue::new(4);
        queue.push(packet(0, true));
        queue.close();
        assert_eq!(queue.push(packet(1, false)), PushOutcome::Closed);
        assert!(matches!(queue.pop_timeout(Duration::ZERO), PopResult::Packet(_)));
        assert!(matches!(queue.pop_timeout(Duration::ZERO), PopResult::Closed));
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = PacketQueue::new(1);
        assert!(matches!(
            queue.pop_timeout(Duration::from_millis(10)),
            PopResult::Empty
        ));
    }

    #[test]
    fn test_producer_wakes_consumer() {
        let queue = Arc::new(PacketQueue::new(4));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.push(packet(7, true));
            })
        };
        let result = queue.pop_timeout(Duration::from_secs(5));
        producer.join().unwrap();
        assert!(matches!(result, PopResult::Packet(p) if p.pts == 7));
    }
}
