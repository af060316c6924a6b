//! Source directory: hashed lookup plus insertion-ordered enumeration.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::source::{SequencePolicy, Source};

#[derive(Debug)]
struct Entry {
    source: Source,
    order: u64,
}

#[derive(Debug)]
pub struct SourceDirectory {
    entries: HashMap<u32, Entry>,
    order: BTreeMap<u64, u32>,
    next_order: u64,
    policy: SequencePolicy,
    senders: usize,
}

impl SourceDirectory {
    pub fn new(capacity: usize, policy: SequencePolicy) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            next_order: 0,
            policy,
            senders: 0,
        }
    }

    /// Drop every source and size the table for `capacity` entries.
    pub fn reinit(&mut self, capacity: usize) {
        self.entries = HashMap::with_capacity(capacity);
        self.order.clear();
        self.senders = 0;
    }

    pub fn set_policy(&mut self, policy: SequencePolicy) {
        self.policy = policy;
    }

    /// Returns the source and whether it was created by this call.
    pub fn lookup_or_create(&mut self, ssrc: u32, now: Instant) -> (&mut Source, bool) {
        let mut created = false;
        let policy = self.policy;
        let order = &mut self.order;
        let next_order = &mut self.next_order;
        let entry = self.entries.entry(ssrc).or_insert_with(|| {
            created = true;
            let slot = *next_order;
            *next_order += 1;
            order.insert(slot, ssrc);
            Entry {
                source: Source::new(ssrc, policy, now),
                order: slot,
            }
        });
        (&mut entry.source, created)
    }

    /// Replace a source with a fresh one, keeping its place in the order.
    pub fn reset(&mut self, ssrc: u32, now: Instant) -> &mut Source {
        if self.get(ssrc).is_some_and(Source::is_sender) {
            self.senders -= 1;
        }
        let policy = self.policy;
        let (source, _) = self.lookup_or_create(ssrc, now);
        *source = Source::new(ssrc, policy, now);
        source
    }

    pub fn get(&self, ssrc: u32) -> Option<&Source> {
        self.entries.get(&ssrc).map(|e| &e.source)
    }

    pub fn get_mut(&mut self, ssrc: u32) -> Option<&mut Source> {
        self.entries.get_mut(&ssrc).map(|e| &mut e.source)
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.entries.contains_key(&ssrc)
    }

    /// Flag the source as leaving without unlinking it, so trailing
    /// packets are still accepted until the grace period ends.
    pub fn mark_leaving(&mut self, ssrc: u32, now: Instant) -> bool {
        match self.entries.get_mut(&ssrc) {
            Some(entry) => {
                entry.source.say_goodbye(now);
                true
            }
            None => false,
        }
    }

    /// Unlink a source. Its queued packets are the caller's to retire.
    pub fn remove(&mut self, ssrc: u32) -> Option<Source> {
        let entry = self.entries.remove(&ssrc)?;
        self.order.remove(&entry.order);
        if entry.source.is_sender() {
            self.senders -= 1;
        }
        Some(entry.source)
    }

    /// Record that the source sent data. Returns true on the first call.
    pub fn mark_sender(&mut self, ssrc: u32) -> bool {
        let Some(entry) = self.entries.get_mut(&ssrc) else {
            return false;
        };
        let first = entry.source.mark_sender();
        if first {
            self.senders += 1;
        }
        first
    }

    /// Sources in the order they were first seen.
    pub fn iter(&self) -> impl Iterator<Item = &Source> + '_ {
        self.order
            .values()
            .filter_map(move |ssrc| self.entries.get(ssrc).map(|e| &e.source))
    }

    pub fn ids(&self) -> Vec<u32> {
        self.order.values().copied().collect()
    }

    /// Sources whose goodbye grace elapsed or that went silent.
    pub fn expired(&self, now: Instant, timeout: Duration, grace: Duration) -> Vec<u32> {
        self.iter()
            .filter(|source| match source.goodbye_at() {
                Some(at) => now.saturating_duration_since(at) >= grace,
                None => source.is_silent_for(now, timeout),
            })
            .map(Source::ssrc)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.entries.len()
    }

    pub fn sender_count(&self) -> usize {
        self.senders
    }
}
