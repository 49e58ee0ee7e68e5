//! Decoded basic-block cache for the cached interpreter.
//!
//! Blocks are keyed by the *physical* address of their first instruction,
//! hold decoded metadata only (never host code), and end at the first
//! branch/jump plus its delay slot, capped at [`BLOCK_MAX_LEN`] entries.
//!
//! Invalidation is deferred: `invalidate`/`invalidate_range` only queue
//! addresses, and the engine drains the queue at block boundaries, so the
//! block it is currently executing is never mutated underneath it. A small
//! direct-mapped lookup cache absorbs the hot-path lookup without a hash
//! probe.

use std::collections::HashMap;
use std::rc::Rc;

use crate::cpu::instruction::Op;

/// Maximum instructions per block (branch delay slot included).
pub const BLOCK_MAX_LEN: usize = 32;
const LOOKUP_CACHE_SIZE: usize = 4;

/// One decoded instruction inside a block. `address` is the virtual PC the
/// instruction was fetched from (the execution loop compares it against the
/// live PC to detect mid-block redirects); `op` is the dispatch handle.
#[derive(Clone, Copy, Debug)]
pub struct BlockEntry {
    pub address: u64,
    pub word: u32,
    pub op: Op,
}

/// A decoded basic block. `start`/`end` are physical, `end` exclusive.
#[derive(Debug)]
pub struct Block {
    pub start: u32,
    pub end: u32,
    pub entries: Vec<BlockEntry>,
    /// Precomputed U8.8 cycle cost: `length * CPI`.
    pub cycle: u32,
}

#[derive(Clone)]
struct LookupSlot {
    address: u32,
    block: Rc<Block>,
}

pub struct BlockCache {
    blocks: HashMap<u32, Rc<Block>>,
    lookup: [Option<LookupSlot>; LOOKUP_CACHE_SIZE],
    lookup_index: usize,
    /// Physical addresses whose owning blocks are queued for removal.
    pending: Vec<u32>,
    clear_queued: bool,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            lookup: [const { None }; LOOKUP_CACHE_SIZE],
            lookup_index: 0,
            pending: Vec::new(),
            clear_queued: false,
        }
    }

    pub fn reset(&mut self) {
        self.blocks.clear();
        self.lookup = [const { None }; LOOKUP_CACHE_SIZE];
        self.lookup_index = 0;
        self.pending.clear();
        self.clear_queued = false;
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Look up the block starting at a physical address. The lookup cache
    /// is searched first (linear scan — it is four entries); a primary-map
    /// hit refills it round-robin.
    pub fn get(&mut self, address: u32) -> Option<Rc<Block>> {
        for slot in self.lookup.iter().flatten() {
            if slot.address == address {
                return Some(Rc::clone(&slot.block));
            }
        }

        let block = self.blocks.get(&address)?;
        let block = Rc::clone(block);
        self.lookup[self.lookup_index] = Some(LookupSlot {
            address,
            block: Rc::clone(&block),
        });
        self.lookup_index = (self.lookup_index + 1) & (LOOKUP_CACHE_SIZE - 1);
        Some(block)
    }

    /// Insert a freshly built block, keyed by `block.start`. All lookup
    /// slots are dropped: handles into the primary map are only reused
    /// through `get`, which revalidates them.
    pub fn insert(&mut self, block: Block) {
        self.blocks.insert(block.start, Rc::new(block));
        for slot in &mut self.lookup {
            *slot = None;
        }
    }

    /// Queue the block owning this physical address for removal. The
    /// primary map is not touched until [`BlockCache::drain`].
    pub fn invalidate(&mut self, address: u32) {
        self.pending.push(address);
    }

    /// Queue every block overlapping `[start, end)` for removal.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        for (&key, block) in &self.blocks {
            if key < end && block.end > start {
                self.pending.push(key);
            }
        }
    }

    /// Queue a full flush.
    pub fn queue_clear(&mut self) {
        self.clear_queued = true;
    }

    /// Apply queued invalidations. Called by the engine at block boundaries
    /// only, so a block is never removed while it executes.
    pub fn drain(&mut self) {
        if self.clear_queued {
            self.blocks.clear();
            self.pending.clear();
            self.clear_queued = false;
            self.lookup = [const { None }; LOOKUP_CACHE_SIZE];
            return;
        }
        if self.pending.is_empty() {
            return;
        }

        for i in 0..self.pending.len() {
            let address = self.pending[i];
            let Some(key) = self
                .blocks
                .iter()
                .find(|(_, block)| address >= block.start && address < block.end)
                .map(|(&key, _)| key)
            else {
                continue;
            };
            let removed = self.blocks.remove(&key).unwrap();
            for slot in &mut self.lookup {
                let stale = slot
                    .as_ref()
                    .is_some_and(|s| Rc::ptr_eq(&s.block, &removed));
                if stale {
                    *slot = None;
                }
            }
        }
        self.pending.clear();
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(start: u32, len: usize) -> Block {
        let entries = (0..len)
            .map(|i| BlockEntry {
                address: u64::from(start) + (i as u64) * 4,
                word: 0,
                op: Op::Nop,
            })
            .collect();
        Block {
            start,
            end: start + (len as u32) * 4,
            entries,
            cycle: (len as u32) << 8,
        }
    }

    #[test]
    fn get_hits_after_insert() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x400, 4));
        let found = cache.get(0x400).unwrap();
        assert_eq!(found.start, 0x400);
        assert_eq!(found.entries.len(), 4);
        // Second call is served by the lookup cache.
        assert!(cache.get(0x400).is_some());
        assert!(cache.get(0x500).is_none());
    }

    #[test]
    fn invalidate_is_deferred_until_drain() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x400, 4));
        cache.invalidate(0x408); // inside the block
        assert!(cache.get(0x400).is_some(), "not removed before drain");
        cache.drain();
        assert!(cache.get(0x400).is_none());
    }

    #[test]
    fn invalidate_any_address_in_block_removes_it() {
        for offset in [0u32, 4, 8, 12] {
            let mut cache = BlockCache::new();
            cache.insert(block(0x400, 4));
            cache.invalidate(0x400 + offset);
            cache.drain();
            assert!(cache.get(0x400).is_none(), "offset {offset}");
        }
        // One past the end does not.
        let mut cache = BlockCache::new();
        cache.insert(block(0x400, 4));
        cache.invalidate(0x410);
        cache.drain();
        assert!(cache.get(0x400).is_some());
    }

    #[test]
    fn invalidate_range_queues_overlapping_blocks() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x400, 4)); // 0x400..0x410
        cache.insert(block(0x410, 4)); // 0x410..0x420
        cache.insert(block(0x800, 4));
        cache.invalidate_range(0x408, 0x414);
        cache.drain();
        assert!(cache.get(0x400).is_none());
        assert!(cache.get(0x410).is_none());
        assert!(cache.get(0x800).is_some());
    }

    #[test]
    fn drained_blocks_leave_no_stale_lookup_slots() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x400, 4));
        // Pull it into the lookup cache, then invalidate and drain.
        assert!(cache.get(0x400).is_some());
        cache.invalidate(0x400);
        cache.drain();
        assert!(cache.get(0x400).is_none());

        // A rebuilt block at the same key is served fresh.
        cache.insert(block(0x400, 2));
        assert_eq!(cache.get(0x400).unwrap().entries.len(), 2);
    }

    #[test]
    fn queue_clear_flushes_everything() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x400, 4));
        cache.insert(block(0x800, 4));
        cache.queue_clear();
        cache.drain();
        assert!(cache.is_empty());
    }
}
