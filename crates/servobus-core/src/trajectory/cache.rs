//! Resend cache: a contiguous ring of already-encoded segments, kept so a
//! sequence error reported by the drive can be answered by resending rather
//! than regenerating — the cache is consulted before the generator.

use super::wire::WireSegment;

pub struct PvtCache {
    capacity: usize,
    slots: Vec<Option<WireSegment>>,
    /// seg_id (mod 0x10000) of `slots[0]`.
    base_id: u16,
}

impl PvtCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: vec![None; capacity],
            base_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base_id(&self) -> u16 {
        self.base_id
    }

    /// Pushes a newly-generated segment, evicting the oldest cached one if
    /// the ring is full.
    pub fn push(&mut self, seg_id: u16, segment: WireSegment) {
        let len = self.slots.iter().filter(|s| s.is_some()).count();
        if len >= self.capacity {
            self.slots.remove(0);
            self.slots.push(None);
            self.base_id = self.base_id.wrapping_add(1);
        }
        let offset = seg_id.wrapping_sub(self.base_id) as usize;
        if offset < self.capacity {
            self.slots[offset] = Some(segment);
        }
    }

    /// Returns the cached segment for `seg_id`, if still resident.
    pub fn get(&self, seg_id: u16) -> Option<WireSegment> {
        let offset = seg_id.wrapping_sub(self.base_id) as usize;
        if offset < self.capacity {
            self.slots[offset]
        } else {
            None
        }
    }

    /// Drops every cached segment strictly before `seg_id` — the drive has
    /// acknowledged consuming them.
    pub fn retire_before(&mut self, seg_id: u16) {
        let advance = seg_id.wrapping_sub(self.base_id) as usize;
        let advance = advance.min(self.capacity);
        self.slots.drain(0..advance);
        self.slots.resize(self.capacity, None);
        self.base_id = self.base_id.wrapping_add(advance as u16);
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::wire::{encode_segment, Sample};

    fn seg(pos: i32) -> WireSegment {
        encode_segment(0, Sample { pos, vel: Some(0), time_ms: 1 }, 0).unwrap().0
    }

    #[test]
    fn retire_before_drops_only_consumed_segments() {
        let mut cache = PvtCache::new(4);
        cache.push(0, seg(1));
        cache.push(1, seg(2));
        cache.push(2, seg(3));
        cache.retire_before(2);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert_eq!(cache.base_id(), 2);
    }

    #[test]
    fn push_past_capacity_evicts_oldest() {
        let mut cache = PvtCache::new(2);
        cache.push(0, seg(1));
        cache.push(1, seg(2));
        cache.push(2, seg(3));
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_some());
    }
}
