use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::packet::Packet;

/// One queued datagram with its destination.
pub struct Outbound {
    pub target: SocketAddr,
    pub packet: Packet,
}

/// FIFO of datagrams waiting for the socket loop.
///
/// Bounded; when full the oldest entry is discarded so the link always
/// carries the freshest commands and beacons. Order of the remaining
/// entries is preserved.
pub struct OutboundQueue {
    entries: Mutex<VecDeque<Outbound>>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, target: SocketAddr, packet: Packet) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
            log::debug!("Outbound queue full, dropping oldest packet");
        }
        entries.push_back(Outbound {
            target,
            packet,
        });
    }

    pub fn pop(&self) -> Option<Outbound> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Outbound>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HeartbeatData;

    fn target() -> SocketAddr {
        "127.0.0.1:5760".parse().unwrap()
    }

    fn heartbeat(uptime: u32) -> Packet {
        Packet::heartbeat(&HeartbeatData {
            uptime,
            ..Default::default()
        })
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = OutboundQueue::new(8);
        for uptime in 0..3 {
            queue.push(target(), heartbeat(uptime));
        }
        for expected in 0..3 {
            let entry = queue.pop().unwrap();
            assert_eq!(entry.packet.heartbeat_data().unwrap().uptime, expected);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = OutboundQueue::new(2);
        for uptime in 0..3 {
            queue.push(target(), heartbeat(uptime));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().packet.heartbeat_data().unwrap().uptime, 1);
        assert_eq!(queue.pop().unwrap().packet.heartbeat_data().unwrap().uptime, 2);
    }
}
