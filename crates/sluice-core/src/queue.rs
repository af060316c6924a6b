//! Packets waiting for the application.
//!
//! Every queued packet is linked into two lists at once: the global list in
//! arrival order and the list of its own source. Nodes live in a slot arena
//! so both lists can splice and unlink in O(1) without shared pointers; a
//! generation counter per slot invalidates stale [`PacketKey`]s.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;

use crate::rtp::RtpPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey {
    index: u32,
    generation: u32,
}

/// A validated packet owned by the queue until it is extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub ssrc: u32,
    /// Media timestamp minus the source's first timestamp.
    pub shifted_timestamp: u32,
    pub arrival: Instant,
    pub packet: RtpPacket,
}

impl QueuedPacket {
    pub fn sequence(&self) -> u16 {
        self.packet.sequence()
    }

    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }

    pub fn into_payload(self) -> Bytes {
        self.packet.into_payload()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error("duplicate timestamp {timestamp} for source {ssrc:#010x}")]
    Duplicate { ssrc: u32, timestamp: u32 },
    #[error("queue full ({0} packets)")]
    Full(usize),
}

#[derive(Debug, Default, Clone, Copy)]
struct Links {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Node {
    item: QueuedPacket,
    global: Links,
    source: Links,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Default)]
struct SourceList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    timestamps: HashSet<u32>,
}

#[derive(Debug)]
pub struct PacketQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    lists: HashMap<u32, SourceList>,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            lists: HashMap::new(),
            capacity,
        }
    }

    /// Append to the tail of both lists.
    ///
    /// A second packet with the same shifted timestamp from the same source
    /// is rejected and dropped.
    pub fn insert(&mut self, item: QueuedPacket) -> Result<PacketKey, InsertError> {
        if self.len >= self.capacity {
            return Err(InsertError::Full(self.capacity));
        }
        let ssrc = item.ssrc;
        let timestamp = item.shifted_timestamp;
        let list = self.lists.entry(ssrc).or_default();
        if !list.timestamps.insert(timestamp) {
            return Err(InsertError::Duplicate { ssrc, timestamp });
        }

        let node = Node {
            item,
            global: Links {
                prev: self.tail,
                next: None,
            },
            source: Links {
                prev: list.tail,
                next: None,
            },
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        };

        match list.tail {
            Some(tail) => {
                if let Some(n) = self.slots[tail as usize].node.as_mut() {
                    n.source.next = Some(index);
                }
            }
            None => list.head = Some(index),
        }
        list.tail = Some(index);
        list.len += 1;

        match self.tail {
            Some(tail) => {
                if let Some(n) = self.slots[tail as usize].node.as_mut() {
                    n.global.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        Ok(PacketKey {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub fn get(&self, key: PacketKey) -> Option<&QueuedPacket> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.node.as_ref().map(|n| &n.item)
    }

    /// Remove and return the first packet with this shifted timestamp,
    /// optionally restricted to one source.
    pub fn extract(&mut self, timestamp: u32, ssrc: Option<u32>) -> Option<QueuedPacket> {
        let index = match ssrc {
            Some(ssrc) => {
                let list = self.lists.get(&ssrc)?;
                if !list.timestamps.contains(&timestamp) {
                    return None;
                }
                self.find(list.head, |l| l.source, |item| {
                    item.shifted_timestamp == timestamp
                })?
            }
            None => self.find(self.head, |l| l.global, |item| {
                item.shifted_timestamp == timestamp
            })?,
        };
        self.unlink(index)
    }

    /// Remove the oldest packet, globally or for one source.
    pub fn pop_front(&mut self, ssrc: Option<u32>) -> Option<QueuedPacket> {
        let index = match ssrc {
            Some(ssrc) => self.lists.get(&ssrc)?.head?,
            None => self.head?,
        };
        self.unlink(index)
    }

    /// Drop every packet whose shifted timestamp is below `before`.
    pub fn expire<F>(&mut self, before: u32, mut on_expired: F) -> usize
    where
        F: FnMut(QueuedPacket),
    {
        let mut doomed = Vec::new();
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let Some(node) = self.node(index) else { break };
            if node.item.shifted_timestamp < before {
                doomed.push(index);
            }
            cursor = node.global.next;
        }
        let count = doomed.len();
        for index in doomed {
            if let Some(item) = self.unlink(index) {
                on_expired(item);
            }
        }
        count
    }

    /// Drop packets that arrived before `deadline`. The global list is in
    /// arrival order, so this only ever looks at the head.
    pub fn expire_arrived_before<F>(&mut self, deadline: Instant, mut on_expired: F) -> usize
    where
        F: FnMut(QueuedPacket),
    {
        let mut count = 0;
        while let Some(index) = self.head {
            match self.node(index) {
                Some(node) if node.item.arrival < deadline => {}
                _ => break,
            }
            if let Some(item) = self.unlink(index) {
                on_expired(item);
                count += 1;
            }
        }
        count
    }

    /// Retire every packet of one source.
    pub fn purge_source(&mut self, ssrc: u32) -> usize {
        let mut count = 0;
        while let Some(index) = self.lists.get(&ssrc).and_then(|l| l.head) {
            if self.unlink(index).is_none() {
                break;
            }
            count += 1;
        }
        count
    }

    pub fn clear(&mut self) -> usize {
        let count = self.len;
        for slot in &mut self.slots {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.lists.clear();
        count
    }

    pub fn is_waiting(&self, ssrc: Option<u32>) -> bool {
        match ssrc {
            Some(ssrc) => self.lists.get(&ssrc).is_some_and(|l| l.len > 0),
            None => self.head.is_some(),
        }
    }

    pub fn first_timestamp(&self, ssrc: Option<u32>) -> Option<u32> {
        let index = match ssrc {
            Some(ssrc) => self.lists.get(&ssrc)?.head?,
            None => self.head?,
        };
        self.node(index).map(|n| n.item.shifted_timestamp)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn source_len(&self, ssrc: u32) -> usize {
        self.lists.get(&ssrc).map_or(0, |l| l.len)
    }

    /// Walk both list families and verify they hold exactly the same nodes.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut global = HashSet::new();
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let node = self
                .node(index)
                .ok_or_else(|| format!("global list points at empty slot {index}"))?;
            if node.global.prev != prev {
                return Err(format!("broken global back link at slot {index}"));
            }
            if !global.insert(index) {
                return Err(format!("global list cycles at slot {index}"));
            }
            prev = Some(index);
            cursor = node.global.next;
        }
        if prev != self.tail {
            return Err("global tail mismatch".into());
        }
        if global.len() != self.len {
            return Err(format!("global length {} != {}", global.len(), self.len));
        }

        let mut per_source = HashSet::new();
        for (&ssrc, list) in &self.lists {
            let mut prev = None;
            let mut cursor = list.head;
            let mut count = 0;
            let mut stamps = HashSet::new();
            while let Some(index) = cursor {
                let node = self
                    .node(index)
                    .ok_or_else(|| format!("source list points at empty slot {index}"))?;
                if node.item.ssrc != ssrc {
                    return Err(format!("slot {index} linked under wrong source"));
                }
                if node.source.prev != prev {
                    return Err(format!("broken source back link at slot {index}"));
                }
                if !per_source.insert(index) {
                    return Err(format!("slot {index} reachable from two source lists"));
                }
                stamps.insert(node.item.shifted_timestamp);
                prev = Some(index);
                cursor = node.source.next;
                count += 1;
            }
            if prev != list.tail || count != list.len || count == 0 {
                return Err(format!("source list {ssrc:#010x} length or tail mismatch"));
            }
            if stamps != list.timestamps {
                return Err(format!("source list {ssrc:#010x} timestamp index stale"));
            }
        }

        if global != per_source {
            return Err("global and per-source lists disagree".into());
        }
        let occupied = self.slots.iter().filter(|s| s.node.is_some()).count();
        if occupied != self.len {
            return Err(format!("{occupied} occupied slots for {} packets", self.len));
        }
        Ok(())
    }

    fn node(&self, index: u32) -> Option<&Node> {
        self.slots.get(index as usize)?.node.as_ref()
    }

    fn find(
        &self,
        start: Option<u32>,
        links: impl Fn(&Node) -> Links,
        matches: impl Fn(&QueuedPacket) -> bool,
    ) -> Option<u32> {
        let mut cursor = start;
        while let Some(index) = cursor {
            let node = self.node(index)?;
            if matches(&node.item) {
                return Some(index);
            }
            cursor = links(node).next;
        }
        None
    }

    fn set_global_next(&mut self, index: Option<u32>, next: Option<u32>) {
        match index {
            Some(i) => {
                if let Some(n) = self.slots[i as usize].node.as_mut() {
                    n.global.next = next;
                }
            }
            None => self.head = next,
        }
    }

    fn set_global_prev(&mut self, index: Option<u32>, prev: Option<u32>) {
        match index {
            Some(i) => {
                if let Some(n) = self.slots[i as usize].node.as_mut() {
                    n.global.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn unlink(&mut self, index: u32) -> Option<QueuedPacket> {
        let slot = self.slots.get_mut(index as usize)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;

        self.set_global_next(node.global.prev, node.global.next);
        self.set_global_prev(node.global.next, node.global.prev);

        let ssrc = node.item.ssrc;
        let mut drop_list = false;
        if let Some(list) = self.lists.get_mut(&ssrc) {
            match node.source.prev {
                Some(p) => {
                    if let Some(n) = self.slots[p as usize].node.as_mut() {
                        n.source.next = node.source.next;
                    }
                }
                None => list.head = node.source.next,
            }
            match node.source.next {
                Some(nx) => {
                    if let Some(n) = self.slots[nx as usize].node.as_mut() {
                        n.source.prev = node.source.prev;
                    }
                }
                None => list.tail = node.source.prev,
            }
            list.len -= 1;
            list.timestamps.remove(&node.item.shifted_timestamp);
            drop_list = list.len == 0;
        }
        if drop_list {
            self.lists.remove(&ssrc);
        }

        Some(node.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacketBuilder;

    fn packet(ssrc: u32, seq: u16, ts: u32, arrival: Instant) -> QueuedPacket {
        let raw = RtpPacketBuilder::new(ssrc)
            .sequence(seq)
            .timestamp(ts)
            .build(&seq.to_be_bytes());
        QueuedPacket {
            ssrc,
            shifted_timestamp: ts,
            arrival,
            packet: RtpPacket::parse(raw).unwrap(),
        }
    }

    #[test]
    fn insert_and_extract_by_timestamp() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        queue.insert(packet(1, 1, 0, now)).unwrap();
        queue.insert(packet(2, 1, 0, now)).unwrap();
        queue.insert(packet(1, 2, 160, now)).unwrap();

        let got = queue.extract(160, Some(1)).unwrap();
        assert_eq!(got.sequence(), 2);
        let got = queue.extract(0, None).unwrap();
        assert_eq!(got.ssrc, 1);
        assert_eq!(queue.len(), 1);
        assert!(queue.extract(999, None).is_none());
        queue.check_consistency().unwrap();
    }

    #[test]
    fn duplicate_timestamp_rejected() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        queue.insert(packet(1, 1, 320, now)).unwrap();
        let err = queue.insert(packet(1, 2, 320, now)).unwrap_err();
        assert_eq!(
            err,
            InsertError::Duplicate {
                ssrc: 1,
                timestamp: 320
            }
        );
        assert_eq!(queue.len(), 1);
        // other sources may reuse the timestamp
        queue.insert(packet(2, 1, 320, now)).unwrap();
        queue.check_consistency().unwrap();
    }

    #[test]
    fn capacity_is_enforced() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(2);
        queue.insert(packet(1, 1, 0, now)).unwrap();
        queue.insert(packet(1, 2, 1, now)).unwrap();
        assert_eq!(
            queue.insert(packet(1, 3, 2, now)),
            Err(InsertError::Full(2))
        );
    }

    #[test]
    fn head_queries() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        assert!(!queue.is_waiting(None));
        assert_eq!(queue.first_timestamp(None), None);

        queue.insert(packet(1, 1, 100, now)).unwrap();
        queue.insert(packet(2, 1, 50, now)).unwrap();
        assert!(queue.is_waiting(Some(2)));
        assert!(!queue.is_waiting(Some(3)));
        assert_eq!(queue.first_timestamp(None), Some(100));
        assert_eq!(queue.first_timestamp(Some(2)), Some(50));
    }

    #[test]
    fn expire_drops_older_packets_and_reports_each() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        for (i, ts) in [10u32, 20, 30, 40].iter().enumerate() {
            queue.insert(packet(1 + (i as u32 % 2), i as u16, *ts, now)).unwrap();
        }
        let mut dropped = Vec::new();
        let count = queue.expire(30, |p| dropped.push(p.shifted_timestamp));
        assert_eq!(count, 2);
        assert_eq!(dropped, vec![10, 20]);
        assert_eq!(queue.len(), 2);
        queue.check_consistency().unwrap();
    }

    #[test]
    fn expire_by_arrival_stops_at_first_fresh_packet() {
        let start = Instant::now();
        let later = start + std::time::Duration::from_secs(5);
        let mut queue = PacketQueue::new(16);
        queue.insert(packet(1, 1, 0, start)).unwrap();
        queue.insert(packet(2, 1, 0, start)).unwrap();
        queue.insert(packet(1, 2, 160, later)).unwrap();

        let count = queue.expire_arrived_before(later, |_| {});
        assert_eq!(count, 2);
        assert_eq!(queue.first_timestamp(None), Some(160));
        queue.check_consistency().unwrap();
    }

    #[test]
    fn purge_source_leaves_others() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        queue.insert(packet(1, 1, 0, now)).unwrap();
        queue.insert(packet(2, 1, 0, now)).unwrap();
        queue.insert(packet(1, 2, 1, now)).unwrap();
        assert_eq!(queue.purge_source(1), 2);
        assert_eq!(queue.source_len(1), 0);
        assert_eq!(queue.len(), 1);
        queue.check_consistency().unwrap();
    }

    #[test]
    fn stale_keys_do_not_resolve() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        let key = queue.insert(packet(1, 1, 0, now)).unwrap();
        assert!(queue.get(key).is_some());
        queue.pop_front(None).unwrap();
        let reused = queue.insert(packet(1, 2, 5, now)).unwrap();
        assert!(queue.get(key).is_none());
        assert!(queue.get(reused).is_some());
    }

    #[test]
    fn pop_front_preserves_both_orders() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        queue.insert(packet(1, 1, 0, now)).unwrap();
        queue.insert(packet(2, 1, 0, now)).unwrap();
        queue.insert(packet(1, 2, 1, now)).unwrap();

        assert_eq!(queue.pop_front(Some(1)).unwrap().sequence(), 1);
        assert_eq!(queue.pop_front(None).unwrap().ssrc, 2);
        assert_eq!(queue.pop_front(None).unwrap().sequence(), 2);
        assert!(queue.pop_front(None).is_none());
        queue.check_consistency().unwrap();
    }

    #[test]
    fn clear_empties_everything() {
        let now = Instant::now();
        let mut queue = PacketQueue::new(16);
        queue.insert(packet(1, 1, 0, now)).unwrap();
        queue.insert(packet(2, 1, 0, now)).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        queue.check_consistency().unwrap();
        queue.insert(packet(1, 1, 0, now)).unwrap();
        queue.check_consistency().unwrap();
    }
}
