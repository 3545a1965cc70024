//! Best-fit caching allocator core
//!
//! Partitions raw device extents into chunks and keeps free chunks in
//! 128 size-class bins (32 exponential "big" bins, each split into 4 linear
//! sub bins). Chunks form two doubly-linked lists at once: physical memory
//! order within their extent, and membership in their bin's free list. Both
//! are expressed as indices into one dense chunk table; id 0 is a reserved
//! sentinel that terminates every list, which keeps the cross-references
//! free of ownership cycles and makes chunk records O(1) to recycle.
//!
//! The table is guarded by a spin mutex: critical sections are a few index
//! updates, short enough that parking would dominate. The one deliberate
//! exception is `extend`, which calls into the device while holding the
//! lock; device-memory growth is serialized by design.

use once_cell::sync::Lazy;

use crate::allocator::align::MIN_ALLOCATION_SIZE;
use crate::allocator::spin::SpinMutex;
use crate::device::DevicePtr;

/// Number of first-level bins (exponential)
const NUM_BIG_BINS: usize = 32;
/// Number of second-level bins per big bin (linear)
const NUM_SUB_BINS: usize = 4;
const LOG_NUM_SUB_BINS: usize = 2;
const NUM_BINS: usize = NUM_BIG_BINS * NUM_SUB_BINS;

/// Tail waste beyond which an oversized chunk is split
const MAX_INTERNAL_FRAGMENTATION: usize = 8 << 20;
/// First extent requested from the device
const MIN_EXTEND_SIZE: usize = 8 << 20;

/// Upper bound for the extent growth step, in bytes. Tunable in MiB through
/// `MEMFORGE_MAX_EXTEND_SIZE`; the older `DIPU_MAX_EXTEND_SIZE` name is
/// still honored as a fallback.
static MAX_EXTEND_SIZE: Lazy<usize> = Lazy::new(|| {
    let mib = std::env::var("MEMFORGE_MAX_EXTEND_SIZE")
        .or_else(|_| std::env::var("DIPU_MAX_EXTEND_SIZE"))
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1024);
    mib << 20
});

/// Device-memory source injected by the facade. Failures are reported as
/// `None`; the core treats that as "no memory" and lets the caller escalate.
pub(crate) type AllocateFn = Box<dyn Fn(usize) -> Option<DevicePtr> + Send>;
pub(crate) type DeallocateFn = Box<dyn Fn(DevicePtr) + Send>;

/// Result of `allocate_raw`: device address, chunk id, rounded size.
/// A null `ptr` means the request could not be satisfied (or was empty).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawBlock {
    pub ptr: DevicePtr,
    pub id: usize,
    pub nbytes: usize,
}

impl RawBlock {
    fn null() -> Self {
        RawBlock {
            ptr: DevicePtr::null(),
            id: 0,
            nbytes: 0,
        }
    }
}

#[derive(Debug)]
struct Chunk {
    allocated: bool,
    // Meaningful only while the chunk sits in a free list.
    bin_id: usize,
    // Physical neighbors within the same extent; 0 = extent edge.
    prev_in_mem: usize,
    next_in_mem: usize,
    // Bin free-list links; 0 = list end.
    prev_in_list: usize,
    next_in_list: usize,
    ptr: DevicePtr,
    size: usize,
    // Stream key of the set this chunk's extent was created for.
    stream: usize,
}

impl Chunk {
    fn new(ptr: DevicePtr, size: usize, stream: usize) -> Self {
        Chunk {
            allocated: false,
            bin_id: 0,
            prev_in_mem: 0,
            next_in_mem: 0,
            prev_in_list: 0,
            next_in_list: 0,
            ptr,
            size,
            stream,
        }
    }

    /// An extent that has coalesced back into a single free chunk
    fn is_monoblock(&self) -> bool {
        self.prev_in_mem == 0 && self.next_in_mem == 0
    }
}

/// Chunks and bins obtained by a single stream.
#[derive(Debug)]
struct StreamSet {
    id: usize,
    // Bit i set iff bin i's free list is non-empty.
    bits: u128,
    // Sentinel chunk ids heading each bin's free list.
    bin_heads: [usize; NUM_BINS],
    // Extent growth step for the next extend.
    curr_extend_size: usize,
}

impl StreamSet {
    fn new(id: usize) -> Self {
        StreamSet {
            id,
            bits: 0,
            bin_heads: [0; NUM_BINS],
            curr_extend_size: MIN_EXTEND_SIZE,
        }
    }

    /// Lowest non-empty bin with index >= `least`
    fn find(&self, least: usize) -> Option<usize> {
        let mask = if least >= NUM_BINS {
            u128::MAX
        } else {
            (1u128 << least) - 1
        };
        let map = self.bits & !mask;
        if map == 0 {
            None
        } else {
            Some(map.trailing_zeros() as usize)
        }
    }

    fn set(&mut self, idx: usize) {
        self.bits |= 1u128 << idx;
    }

    fn clear(&mut self, idx: usize) {
        self.bits &= !(1u128 << idx);
    }
}

/// Round up to the allocation quantum. Callers guarantee `nbytes > 0`.
fn round_bytes(nbytes: usize) -> usize {
    ((nbytes - 1) | (MIN_ALLOCATION_SIZE - 1)) + 1
}

/// Size-class of a rounded request.
///
/// Big bin B covers [2^B, 2^(B+1)) in 512-byte blocks and is cut into 4
/// linear sub bins; anything past the last big bin lands in bin 127.
fn bin_id_for_size(nbytes: usize) -> usize {
    let n_blocks = (nbytes / MIN_ALLOCATION_SIZE) as u64;
    debug_assert!(n_blocks > 0);
    let big_bin = 63 - n_blocks.leading_zeros() as usize;
    if big_bin > NUM_BIG_BINS - 1 {
        return NUM_BINS - 1;
    }
    let sub_bin =
        ((n_blocks ^ (1u64 << big_bin)) >> big_bin.saturating_sub(LOG_NUM_SUB_BINS)) as usize;
    big_bin * NUM_SUB_BINS + sub_bin
}

struct BFCore {
    allocate_fn: AllocateFn,
    deallocate_fn: DeallocateFn,
    // Bytes currently held from the device, allocated or cached.
    cached_bytes: usize,
    // Bytes currently handed out to callers.
    allocated_bytes: usize,
    chunks: Vec<Chunk>,
    recycle_ids: Vec<usize>,
    stream_sets: Vec<Option<StreamSet>>,
}

impl BFCore {
    fn allocate_on_device(&mut self, nbytes: usize) -> Option<DevicePtr> {
        let ptr = (self.allocate_fn)(nbytes).filter(|p| !p.is_null());
        match ptr {
            Some(p) => {
                self.cached_bytes += nbytes;
                tracing::debug!("bfc: obtained extent of {} bytes at {:p}", nbytes, p);
                Some(p)
            }
            None => {
                tracing::debug!("bfc: device refused extent of {} bytes", nbytes);
                None
            }
        }
    }

    fn release_on_device(&mut self, ptr: DevicePtr, nbytes: usize) {
        tracing::debug!("bfc: returning extent of {} bytes at {:p}", nbytes, ptr);
        (self.deallocate_fn)(ptr);
        self.cached_bytes -= nbytes;
    }

    /// Fresh chunk record, recycling a retired id when one is available.
    /// Null-ptr chunks (the id-0 sentinel and bin heads) are flagged
    /// allocated so free-list scans never mistake them for user chunks.
    fn new_chunk(&mut self, ptr: DevicePtr, size: usize, stream: usize) -> usize {
        let id = match self.recycle_ids.pop() {
            Some(id) => {
                self.chunks[id] = Chunk::new(ptr, size, stream);
                id
            }
            None => {
                self.chunks.push(Chunk::new(ptr, size, stream));
                self.chunks.len() - 1
            }
        };
        if ptr.is_null() {
            self.chunks[id].allocated = true;
        }
        id
    }

    fn link_chunk_in_list(&mut self, a: usize, b: usize, c: usize) {
        self.chunks[a].next_in_list = b;
        self.chunks[b].prev_in_list = a;
        self.chunks[b].next_in_list = c;
        self.chunks[c].prev_in_list = b;
    }

    fn link_chunk_in_mem(&mut self, a: usize, b: usize, c: usize) {
        self.chunks[a].next_in_mem = b;
        self.chunks[b].prev_in_mem = a;
        self.chunks[b].next_in_mem = c;
        self.chunks[c].prev_in_mem = b;
    }

    /// Unlink the chunk between `a` and `c` from its bin list
    fn remove_chunk_in_list(&mut self, a: usize, c: usize) {
        self.chunks[a].next_in_list = c;
        self.chunks[c].prev_in_list = a;
    }

    /// Unlink the chunk between `a` and `c` from memory order
    fn remove_chunk_in_mem(&mut self, a: usize, c: usize) {
        self.chunks[a].next_in_mem = c;
        self.chunks[c].prev_in_mem = a;
    }

    fn insert_chunk_into_bin(&mut self, id: usize) {
        let bin_id = bin_id_for_size(self.chunks[id].size);
        self.chunks[id].bin_id = bin_id;
        let stream = self.chunks[id].stream;
        let head = {
            let set = self.stream_sets[stream]
                .as_mut()
                .expect("stream set exists for live chunk");
            set.set(bin_id);
            set.bin_heads[bin_id]
        };
        let next = self.chunks[head].next_in_list;
        self.link_chunk_in_list(head, id, next);
    }

    fn remove_chunk_from_bin(&mut self, id: usize) {
        let bin_id = self.chunks[id].bin_id;
        let stream = self.chunks[id].stream;
        let prev = self.chunks[id].prev_in_list;
        let next = self.chunks[id].next_in_list;
        self.remove_chunk_in_list(prev, next);
        let head = self.stream_sets[stream]
            .as_ref()
            .expect("stream set exists for live chunk")
            .bin_heads[bin_id];
        if self.chunks[head].next_in_list == 0 {
            self.stream_sets[stream]
                .as_mut()
                .expect("stream set exists for live chunk")
                .clear(bin_id);
        }
    }

    /// Best-fit lookup: the first chunk of the floor bin if it is large
    /// enough (the floor bin is a lower bound, its head chunk may be
    /// smaller than the request), otherwise the first chunk of the lowest
    /// non-empty bin above. Detaches the winner from its bin.
    fn find_chunk(&mut self, nbytes: usize, stream: usize) -> usize {
        let least = bin_id_for_size(nbytes);
        let head = self.stream_sets[stream]
            .as_ref()
            .expect("checked by caller")
            .bin_heads[least];
        let mut id = self.chunks[head].next_in_list;
        if id != 0 && self.chunks[id].size < nbytes {
            id = 0;
        }

        if id == 0 {
            let set = self.stream_sets[stream].as_ref().expect("checked by caller");
            id = match set.find(least + 1) {
                Some(bin_id) => self.chunks[set.bin_heads[bin_id]].next_in_list,
                None => 0,
            };
        }

        if id != 0 {
            self.remove_chunk_from_bin(id);
        }
        id
    }

    /// Return every free monoblock of this set to the device
    fn shrink_set(&mut self, stream: usize) {
        let bin_heads = match &self.stream_sets[stream] {
            Some(set) => set.bin_heads,
            None => return,
        };
        for head in bin_heads {
            let mut k = self.chunks[head].next_in_list;
            while k != 0 {
                if self.chunks[k].is_monoblock() {
                    let ptr = self.chunks[k].ptr;
                    let size = self.chunks[k].size;
                    self.release_on_device(ptr, size);
                    self.remove_chunk_from_bin(k);
                    self.recycle_ids.push(k);
                }
                k = self.chunks[k].next_in_list;
            }
        }
    }

    /// Cut `id` at `nbytes`; the tail becomes a new chunk directly after it
    /// in memory order and re-enters its bin.
    fn split(&mut self, id: usize, nbytes: usize) -> usize {
        let tail_ptr = self.chunks[id].ptr.byte_add(nbytes);
        let tail_size = self.chunks[id].size - nbytes;
        let stream = self.chunks[id].stream;

        self.chunks[id].size = nbytes;

        let new_id = self.new_chunk(tail_ptr, tail_size, stream);
        let next = self.chunks[id].next_in_mem;
        self.link_chunk_in_mem(id, new_id, next);
        self.insert_chunk_into_bin(new_id);

        id
    }

    /// Absorb `c2` (the physical successor) into `c1`
    fn merge(&mut self, c1: usize, c2: usize) -> usize {
        self.chunks[c1].size += self.chunks[c2].size;
        let next = self.chunks[c2].next_in_mem;
        self.remove_chunk_in_mem(c1, next);
        c1
    }

    /// Merge `id` with whichever physical neighbors are free; returns the
    /// id of the surviving chunk.
    fn coalesce(&mut self, mut id: usize) -> usize {
        let next = self.chunks[id].next_in_mem;
        if next != 0 && !self.chunks[next].allocated {
            self.remove_chunk_from_bin(next);
            id = self.merge(id, next);
            self.recycle_ids.push(next);
        }

        let prev = self.chunks[id].prev_in_mem;
        if prev != 0 && !self.chunks[prev].allocated {
            self.remove_chunk_from_bin(prev);
            let old_id = id;
            id = self.merge(prev, id);
            self.recycle_ids.push(old_id);
        }

        id
    }

    /// Grow the pool by a fresh extent covering at least `nbytes`.
    ///
    /// Free monoblocks are returned to the device first so the driver can
    /// hand back one larger extent instead of fragmenting. The growth step
    /// doubles while it is smaller than the request, and doubles once more
    /// after an effortless success so sustained pressure ramps extent sizes
    /// up to the cap. If the device refuses the stepped size, the exact
    /// request is retried before giving up.
    fn extend(&mut self, nbytes: usize, stream: usize) -> usize {
        self.empty_cache_locked();

        let max_extend = *MAX_EXTEND_SIZE;
        let mut increased = false;
        {
            let set = self.stream_sets[stream].as_mut().expect("checked by caller");
            while set.curr_extend_size < nbytes && set.curr_extend_size < max_extend {
                set.curr_extend_size *= 2;
                increased = true;
            }
        }
        let (ext, set_id) = {
            let set = self.stream_sets[stream].as_ref().expect("checked by caller");
            (set.curr_extend_size, set.id)
        };

        let mut curr_bytes = nbytes.max(ext);
        let mut ptr = self.allocate_on_device(curr_bytes);
        if ptr.is_some() {
            if !increased && ext < max_extend {
                self.stream_sets[stream]
                    .as_mut()
                    .expect("checked by caller")
                    .curr_extend_size = ext * 2;
            }
        } else if curr_bytes > nbytes {
            curr_bytes = nbytes;
            ptr = self.allocate_on_device(curr_bytes);
        }

        match ptr {
            Some(p) => self.new_chunk(p, curr_bytes, set_id),
            None => 0,
        }
    }

    /// Get or create the bin set for `stream`. Bin-head sentinels are
    /// created once and never freed.
    fn check_stream(&mut self, stream: usize) {
        if stream >= self.stream_sets.len() {
            self.stream_sets.resize_with(stream + 1, || None);
        }
        if self.stream_sets[stream].is_none() {
            let mut set = StreamSet::new(stream);
            for head in set.bin_heads.iter_mut() {
                *head = self.new_chunk(DevicePtr::null(), 0, 0);
            }
            self.stream_sets[stream] = Some(set);
        }
    }

    fn empty_cache_locked(&mut self) {
        for stream in 0..self.stream_sets.len() {
            if self.stream_sets[stream].is_some() {
                self.shrink_set(stream);
            }
        }
    }
}

/// Lock-protected best-fit core. The facade layers the async release pool
/// and escalation policy on top; this type only knows chunks, bins and the
/// injected raw-memory source.
pub(crate) struct BFCachingAllocatorImpl {
    core: SpinMutex<BFCore>,
}

impl BFCachingAllocatorImpl {
    pub(crate) fn new(allocate_fn: AllocateFn, deallocate_fn: DeallocateFn) -> Self {
        let mut core = BFCore {
            allocate_fn,
            deallocate_fn,
            cached_bytes: 0,
            allocated_bytes: 0,
            chunks: Vec::new(),
            recycle_ids: Vec::new(),
            stream_sets: Vec::new(),
        };
        // Reserve id 0 as the universal list terminator.
        core.new_chunk(DevicePtr::null(), 0, 0);
        BFCachingAllocatorImpl {
            core: SpinMutex::new(core),
        }
    }

    /// Allocate `size` bytes. Returns a null block when `size` is 0 or no
    /// memory could be obtained; the caller decides how hard to reclaim.
    pub(crate) fn allocate_raw(&self, size: usize) -> RawBlock {
        if size == 0 {
            return RawBlock::null();
        }

        let nbytes = round_bytes(size);

        let mut core = self.core.lock();
        // All allocations currently share stream set 0 regardless of the
        // requesting stream; see the per-stream note in DESIGN.md.
        core.check_stream(0);
        let mut id = core.find_chunk(nbytes, 0);
        if id == 0 {
            id = core.extend(nbytes, 0);
        }

        if id != 0 {
            if core.chunks[id].size >= nbytes.saturating_mul(2)
                || core.chunks[id].size >= nbytes.saturating_add(MAX_INTERNAL_FRAGMENTATION)
            {
                id = core.split(id, nbytes);
            }
            core.chunks[id].allocated = true;
            // An unsplit chunk can exceed the rounded request; account for
            // what was actually handed out so release balances.
            core.allocated_bytes += core.chunks[id].size;
            return RawBlock {
                ptr: core.chunks[id].ptr,
                id,
                nbytes,
            };
        }
        RawBlock::null()
    }

    /// Hand a chunk back: coalesce with free physical neighbors and re-bin
    /// the result. Only called once the buffer's guarding events completed.
    pub(crate) fn release_raw(&self, ptr: DevicePtr, id: usize) {
        if ptr.is_null() {
            return;
        }

        let mut core = self.core.lock();
        core.chunks[id].allocated = false;
        core.allocated_bytes -= core.chunks[id].size;
        let id = core.coalesce(id);
        core.insert_chunk_into_bin(id);
    }

    /// Return every free monoblock to the device. The only path that gives
    /// memory back.
    pub(crate) fn empty_cache(&self) {
        self.core.lock().empty_cache_locked();
    }

    /// Bytes currently held from the device (allocated + cached)
    pub(crate) fn memory_reserved(&self) -> usize {
        self.core.lock().cached_bytes
    }

    #[cfg(test)]
    fn allocated_bytes(&self) -> usize {
        self.core.lock().allocated_bytes
    }

    #[cfg(test)]
    fn curr_extend_size(&self, stream: usize) -> usize {
        self.core.lock().stream_sets[stream]
            .as_ref()
            .expect("stream set exists")
            .curr_extend_size
    }

    /// Structural self-check used by the tests: bin membership, bitmap,
    /// adjacency, alignment, coalescing completeness and byte accounting.
    #[cfg(test)]
    fn validate(&self) {
        use std::collections::HashSet;

        let core = self.core.lock();
        let recycled: HashSet<usize> = core.recycle_ids.iter().copied().collect();
        let mut free_in_bins: HashSet<usize> = HashSet::new();

        for set in core.stream_sets.iter().flatten() {
            for (bin_id, &head) in set.bin_heads.iter().enumerate() {
                let mut prev = head;
                let mut k = core.chunks[head].next_in_list;
                let occupied = k != 0;
                assert_eq!(
                    set.bits & (1u128 << bin_id) != 0,
                    occupied,
                    "bitmap bit {} disagrees with bin occupancy",
                    bin_id
                );
                while k != 0 {
                    let c = &core.chunks[k];
                    assert!(!c.allocated, "allocated chunk {} sits in bin {}", k, bin_id);
                    assert_eq!(c.bin_id, bin_id, "chunk {} carries wrong bin id", k);
                    assert_eq!(
                        bin_id_for_size(c.size),
                        bin_id,
                        "chunk {} of {} bytes binned as {}",
                        k,
                        c.size,
                        bin_id
                    );
                    assert_eq!(c.prev_in_list, prev, "broken back link at chunk {}", k);
                    assert!(
                        free_in_bins.insert(k),
                        "chunk {} appears in more than one bin list",
                        k
                    );
                    prev = k;
                    k = c.next_in_list;
                }
            }
        }

        let mut cached = 0usize;
        let mut allocated = 0usize;
        for (id, c) in core.chunks.iter().enumerate() {
            if id == 0 || recycled.contains(&id) || c.ptr.is_null() {
                continue;
            }
            assert_eq!(c.size % MIN_ALLOCATION_SIZE, 0, "chunk {} size unaligned", id);
            assert_eq!(
                c.ptr.as_raw() as usize % MIN_ALLOCATION_SIZE,
                0,
                "chunk {} address unaligned",
                id
            );
            cached += c.size;
            if c.allocated {
                allocated += c.size;
            } else {
                assert!(
                    free_in_bins.contains(&id),
                    "free chunk {} is in no bin list",
                    id
                );
            }
            let next = c.next_in_mem;
            if next != 0 {
                let n = &core.chunks[next];
                assert_eq!(
                    c.ptr.byte_add(c.size),
                    n.ptr,
                    "chunks {} and {} are linked but not contiguous",
                    id,
                    next
                );
                assert_eq!(n.prev_in_mem, id, "asymmetric memory link at {}", id);
                assert!(
                    c.allocated || n.allocated,
                    "adjacent free chunks {} and {} were not coalesced",
                    id,
                    next
                );
            }
        }
        assert_eq!(cached, core.cached_bytes, "cached byte counter drifted");
        assert_eq!(
            allocated, core.allocated_bytes,
            "allocated byte counter drifted"
        );
    }
}

impl Drop for BFCachingAllocatorImpl {
    fn drop(&mut self) {
        self.empty_cache();
    }
}
