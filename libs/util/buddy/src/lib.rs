// This file is part of Cinder.
//
// Cinder is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Cinder is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Cinder.  If not, see <http://www.gnu.org/licenses/>.

//! Two-level segregated-fit allocator over a flat `[0, capacity)` slot space.
//!
//! Free blocks live in per-`(fli, sli)` lists: `fli` selects the power-of-two
//! size class, `sli` splits each class into `1 << SLI` sub-classes. A
//! top-level bitmask of non-empty classes and a per-class sub-mask make both
//! the exact-fit and the next-larger-fit lookups a masked bit-scan, so
//! allocation is O(1) and free is O(1) plus at most two coalesce steps.

use log::trace;
use sparse::{SparseId, SparseSet};

const SLI: u32 = 4;
const MIN_FLI: u32 = SLI - 1;
const NUM_SL_BUCKETS: usize = 1 << SLI;
const SLI_MASK: u32 = (1 << SLI) - 1;
const MIN_SIZE: u32 = 1 << SLI;

/// A contiguous run of slots owned by one allocation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Range {
    pub offset: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug)]
struct Node {
    size: u32,
    offset: u32,
    next_free: Option<SparseId>,
    prev_free: Option<SparseId>,
    next_physical: Option<SparseId>,
    prev_physical: Option<SparseId>,
    is_free: bool,
}

struct Level {
    mask: u64,
    free: [Option<SparseId>; NUM_SL_BUCKETS],
}

impl Default for Level {
    fn default() -> Self {
        Self {
            mask: 0,
            free: [None; NUM_SL_BUCKETS],
        }
    }
}

fn compute_fli(size: u32) -> usize {
    if size < MIN_SIZE {
        return 0;
    }
    (31 - size.leading_zeros() - MIN_FLI) as usize
}

fn compute_sli(size: u32, f: usize) -> usize {
    if f == 0 {
        return (size & SLI_MASK) as usize;
    }
    ((size >> (f as u32 + MIN_FLI - SLI)) & SLI_MASK) as usize
}

// Round a request up so the chosen sub-bucket is guaranteed to fit it.
fn round_size(size: u32) -> u32 {
    let f = compute_fli(size);
    if f == 0 {
        return size;
    }
    size + (1u32 << (f - 1)) - 1
}

fn block_size(f: usize, s: usize) -> u32 {
    if f == 0 {
        return s as u32;
    }
    (1u32 << (f as u32 + MIN_FLI)) + ((s as u32) << (f as u32 + MIN_FLI - SLI))
}

/// Best-fit free-list allocator with O(1) lookup and physical coalescing.
#[derive(Default)]
pub struct BuddyAllocator {
    mask: u64,
    levels: Vec<Level>,
    nodes: SparseSet<Node>,
}

impl BuddyAllocator {
    pub fn new(capacity: u32) -> Self {
        let mut allocator = Self::default();
        allocator.add_block(capacity, 0);
        allocator
    }

    /// Seed a region of slots. Regions must not overlap; blocks smaller than
    /// the minimum bucket granularity are ignored.
    pub fn add_block(&mut self, size: u32, offset: u32) {
        if size < MIN_SIZE {
            return;
        }

        let f = compute_fli(size);
        let s = compute_sli(size, f);
        debug_assert!(size >= block_size(f, s));
        self.ensure_level(f);

        trace!("buddy: seeding block of {} slots at {}", size, offset);
        let block = self.nodes.insert(Node {
            size,
            offset,
            next_free: None,
            prev_free: None,
            next_physical: None,
            prev_physical: None,
            is_free: true,
        });
        self.push_block_at(block, f, s);
    }

    pub fn is_allocated(&self, id: SparseId) -> bool {
        match self.nodes.get(id) {
            Some(node) => !node.is_free,
            None => false,
        }
    }

    /// The slot range backing `id`; zero if `id` is not a live allocation.
    pub fn range_of(&self, id: SparseId) -> Range {
        match self.nodes.get(id) {
            Some(node) if !node.is_free => Range {
                offset: node.offset,
                size: node.size,
            },
            _ => Range::default(),
        }
    }

    /// Find a block of at least `size` slots. `None` is not an error: callers
    /// use it as the signal to start evicting.
    pub fn allocate(&mut self, size: u32) -> Option<SparseId> {
        if size == 0 {
            return None;
        }

        let rounded = round_size(size);
        let mut f = compute_fli(rounded);
        let mut s = compute_sli(rounded, f);
        debug_assert!(block_size(f, s) >= size);

        let class_mask = self
            .levels
            .get(f)
            .map(|level| level.mask & (!0u64 << s))
            .unwrap_or(0);

        let block = if class_mask != 0 {
            s = class_mask.trailing_zeros() as usize;
            self.pop_head(f, s)
        } else {
            let upper_mask = self.mask & (!0u64 << (f + 1));
            if upper_mask == 0 {
                return None;
            }
            f = upper_mask.trailing_zeros() as usize;
            debug_assert_ne!(self.levels[f].mask, 0);
            s = self.levels[f].mask.trailing_zeros() as usize;
            self.pop_head(f, s)
        }?;

        self.split_block(block, size);
        debug_assert!(self.node(block).size >= size);
        Some(block)
    }

    /// Return an allocation to the free lists, coalescing with free physical
    /// neighbors. Unknown or already-free ids are ignored.
    pub fn deallocate(&mut self, id: SparseId) {
        if !self.is_allocated(id) {
            return;
        }
        let merged = self.merge_block(id);
        self.push_block(merged);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.levels.clear();
        self.mask = 0;
    }

    fn node(&self, id: SparseId) -> &Node {
        self.nodes.get(id).expect("stale allocator node id")
    }

    fn node_mut(&mut self, id: SparseId) -> &mut Node {
        self.nodes.get_mut(id).expect("stale allocator node id")
    }

    fn ensure_level(&mut self, f: usize) {
        while self.levels.len() <= f {
            self.levels.push(Level::default());
        }
    }

    fn pop_head(&mut self, f: usize, s: usize) -> Option<SparseId> {
        let block = self.levels[f].free[s]?;
        self.pop_block_at(block, f, s);
        Some(block)
    }

    fn pop_block(&mut self, block: SparseId) {
        let node = self.node(block);
        let f = compute_fli(node.size);
        let s = compute_sli(node.size, f);
        debug_assert!(node.size >= block_size(f, s));
        self.pop_block_at(block, f, s);
    }

    fn pop_block_at(&mut self, block: SparseId, f: usize, s: usize) {
        debug_assert_ne!(self.mask & (1u64 << f), 0);
        debug_assert_ne!(self.levels[f].mask & (1u64 << s), 0);

        let (prev_free, next_free) = {
            let node = self.node(block);
            (node.prev_free, node.next_free)
        };

        if self.levels[f].free[s] == Some(block) {
            debug_assert!(prev_free.is_none());
            self.levels[f].free[s] = next_free;
            if next_free.is_none() {
                self.levels[f].mask ^= 1u64 << s;
                if self.levels[f].mask == 0 {
                    self.mask ^= 1u64 << f;
                }
            }
        } else {
            debug_assert!(prev_free.is_some());
            self.node_mut(prev_free.expect("not the list head")).next_free = next_free;
        }

        if let Some(next) = next_free {
            self.node_mut(next).prev_free = prev_free;
        }

        let node = self.node_mut(block);
        node.next_free = None;
        node.prev_free = None;
        node.is_free = false;
    }

    fn push_block(&mut self, block: SparseId) {
        let node = self.node(block);
        let f = compute_fli(node.size);
        let s = compute_sli(node.size, f);
        self.push_block_at(block, f, s);
    }

    fn push_block_at(&mut self, block: SparseId, f: usize, s: usize) {
        debug_assert!(self.node(block).size >= block_size(f, s));
        self.ensure_level(f);

        self.mask |= 1u64 << f;
        self.levels[f].mask |= 1u64 << s;

        let head = self.levels[f].free[s];
        {
            let node = self.node_mut(block);
            node.is_free = true;
            node.next_free = head;
            node.prev_free = None;
        }
        if let Some(head) = head {
            self.node_mut(head).prev_free = Some(block);
        }
        self.levels[f].free[s] = Some(block);
    }

    // Carve `size` slots off the front of `block`, returning the remainder to
    // its free list.
    fn split_block(&mut self, block: SparseId, size: u32) {
        debug_assert!(self.node(block).size >= size);

        let remaining = self.node(block).size - size;
        if remaining == 0 {
            return;
        }

        let f = compute_fli(remaining);
        let s = compute_sli(remaining, f);
        debug_assert!(block_size(f, s) <= remaining);

        let (offset, next_physical) = {
            let node = self.node(block);
            (node.offset, node.next_physical)
        };
        let remainder = self.nodes.insert(Node {
            size: remaining,
            offset: offset + size,
            next_free: None,
            prev_free: None,
            next_physical,
            prev_physical: Some(block),
            is_free: true,
        });
        if let Some(next) = next_physical {
            self.node_mut(next).prev_physical = Some(remainder);
        }
        {
            let node = self.node_mut(block);
            node.next_physical = Some(remainder);
            node.size = size;
        }

        self.push_block_at(remainder, f, s);
    }

    // Coalesce with the physical predecessor and successor when free.
    fn merge_block(&mut self, mut block: SparseId) -> SparseId {
        if let Some(prev_id) = self.node(block).prev_physical {
            if self.node(prev_id).is_free {
                self.pop_block(prev_id);
                let (size, next_physical) = {
                    let node = self.node(block);
                    (node.size, node.next_physical)
                };
                {
                    let prev = self.node_mut(prev_id);
                    prev.size += size;
                    prev.next_physical = next_physical;
                }
                if let Some(next) = next_physical {
                    self.node_mut(next).prev_physical = Some(prev_id);
                }
                self.nodes.remove(block);
                block = prev_id;
            }
        }

        if let Some(next_id) = self.node(block).next_physical {
            if self.node(next_id).is_free {
                self.pop_block(next_id);
                let (size, next_physical) = {
                    let next = self.node(next_id);
                    (next.size, next.next_physical)
                };
                {
                    let node = self.node_mut(block);
                    node.size += size;
                    node.next_physical = next_physical;
                }
                if let Some(next) = next_physical {
                    self.node_mut(next).prev_physical = Some(block);
                }
                self.nodes.remove(next_id);
            }
        }

        block
    }

    /// Walk every node and check the free-list, mask, and physical-link
    /// invariants. Debug and test builds only.
    #[cfg(any(test, debug_assertions))]
    pub fn validate(&self) {
        for (id, node) in self.nodes.iter() {
            if let Some(next) = node.next_physical {
                let next_node = self.node(next);
                assert_eq!(next_node.offset, node.offset + node.size);
                assert_eq!(next_node.prev_physical, Some(id));
            }
            if let Some(prev) = node.prev_physical {
                let prev_node = self.node(prev);
                assert_eq!(prev_node.offset + prev_node.size, node.offset);
                assert_eq!(prev_node.next_physical, Some(id));
            }

            let f = compute_fli(node.size);
            let s = compute_sli(node.size, f);
            assert!(node.size >= block_size(f, s));

            if node.is_free {
                assert_ne!(self.mask & (1u64 << f), 0);
                assert_ne!(self.levels[f].mask & (1u64 << s), 0);
                assert!(self.levels[f].free[s] == Some(id) || node.prev_free.is_some());
                if let Some(next) = node.next_free {
                    assert_eq!(self.node(next).prev_free, Some(id));
                }
                if let Some(prev) = node.prev_free {
                    assert_eq!(self.node(prev).next_free, Some(id));
                }
            } else {
                assert!(node.next_free.is_none() && node.prev_free.is_none());
            }
        }

        // Every set mask bit must correspond to a non-empty list and each
        // free-list member must be reachable from exactly one head.
        let mut reachable = 0;
        for (f, level) in self.levels.iter().enumerate() {
            assert_eq!(self.mask & (1u64 << f) != 0, level.mask != 0);
            for (s, head) in level.free.iter().enumerate() {
                assert_eq!(level.mask & (1u64 << s) != 0, head.is_some());
                let mut cursor = *head;
                while let Some(id) = cursor {
                    reachable += 1;
                    cursor = self.node(id).next_free;
                }
            }
        }
        let free_count = self.nodes.values().filter(|node| node.is_free).count();
        assert_eq!(reachable, free_count);
    }

    #[cfg(any(test, debug_assertions))]
    pub fn free_slots(&self) -> u64 {
        self.nodes
            .values()
            .filter(|node| node.is_free)
            .map(|node| u64::from(node.size))
            .sum()
    }

    #[cfg(any(test, debug_assertions))]
    pub fn allocated_slots(&self) -> u64 {
        self.nodes
            .values()
            .filter(|node| !node.is_free)
            .map(|node| u64::from(node.size))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: u32 = 1 << 16;

    fn check_no_overlap(allocator: &BuddyAllocator, live: &[SparseId]) {
        let mut ranges: Vec<Range> = live.iter().map(|id| allocator.range_of(*id)).collect();
        ranges.sort_by_key(|r| r.offset);
        for pair in ranges.windows(2) {
            assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }
    }

    #[test]
    fn allocate_returns_requested_size_or_more() {
        let mut allocator = BuddyAllocator::new(POOL);
        let id = allocator.allocate(100).expect("pool is empty");
        let range = allocator.range_of(id);
        assert!(range.size >= 100);
        assert!(allocator.is_allocated(id));
        allocator.validate();
    }

    #[test]
    fn conservation_across_random_traffic() {
        let mut allocator = BuddyAllocator::new(POOL);
        let rng = fastrand::Rng::with_seed(0x5eed);
        let mut live = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.bool() {
                if let Some(id) = allocator.allocate(rng.u32(1..512)) {
                    live.push(id);
                }
            } else {
                let id = live.swap_remove(rng.usize(..live.len()));
                allocator.deallocate(id);
            }

            allocator.validate();
            assert_eq!(
                allocator.free_slots() + allocator.allocated_slots(),
                u64::from(POOL)
            );
            check_no_overlap(&allocator, &live);
        }
    }

    #[test]
    fn free_coalesces_back_to_a_single_block() {
        let mut allocator = BuddyAllocator::new(POOL);
        let ids: Vec<_> = (0..128).map(|_| allocator.allocate(512).unwrap()).collect();
        assert_eq!(allocator.allocated_slots(), u64::from(POOL));
        for id in ids {
            allocator.deallocate(id);
        }
        allocator.validate();
        assert_eq!(allocator.free_slots(), u64::from(POOL));
        // Fully coalesced: the whole pool must be allocatable again in one
        // piece.
        let id = allocator.allocate(POOL).expect("pool did not coalesce");
        assert_eq!(allocator.range_of(id).size, POOL);
    }

    #[test]
    fn at_capacity_allocate_fails_until_freed() {
        let mut allocator = BuddyAllocator::new(POOL);
        let whole = allocator.allocate(POOL).expect("first fill");
        assert!(allocator.allocate(1).is_none());
        assert!(allocator.allocate(POOL).is_none());
        allocator.deallocate(whole);
        assert!(allocator.allocate(POOL).is_some());
    }

    #[test]
    fn double_free_is_ignored() {
        let mut allocator = BuddyAllocator::new(POOL);
        let a = allocator.allocate(64).unwrap();
        let b = allocator.allocate(64).unwrap();
        allocator.deallocate(a);
        allocator.deallocate(a);
        allocator.validate();
        assert_eq!(
            allocator.free_slots() + allocator.allocated_slots(),
            u64::from(POOL)
        );
        assert!(allocator.is_allocated(b));
    }

    #[test]
    fn oversized_request_is_refused() {
        let mut allocator = BuddyAllocator::new(POOL);
        assert!(allocator.allocate(POOL + 1).is_none());
        assert!(allocator.allocate(u32::MAX).is_none());
        allocator.validate();
    }

    #[test]
    fn range_of_stale_id_is_zero() {
        let mut allocator = BuddyAllocator::new(POOL);
        let id = allocator.allocate(32).unwrap();
        allocator.deallocate(id);
        assert_eq!(allocator.range_of(id), Range::default());
        assert!(!allocator.is_allocated(id));
    }

    #[test]
    fn multiple_seeded_regions_never_cross_coalesce() {
        let mut allocator = BuddyAllocator::default();
        allocator.add_block(1024, 0);
        allocator.add_block(1024, 4096);
        let a = allocator.allocate(1024).unwrap();
        let b = allocator.allocate(1024).unwrap();
        allocator.deallocate(a);
        allocator.deallocate(b);
        allocator.validate();
        // Regions are physically disjoint, so the largest satisfiable request
        // is still one region.
        assert!(allocator.allocate(2048).is_none());
        assert!(allocator.allocate(1024).is_some());
    }

    #[test]
    fn clear_drops_everything() {
        let mut allocator = BuddyAllocator::new(POOL);
        let _ = allocator.allocate(128);
        allocator.clear();
        assert!(allocator.allocate(1).is_none());
        allocator.add_block(POOL, 0);
        assert!(allocator.allocate(POOL).is_some());
    }
}
