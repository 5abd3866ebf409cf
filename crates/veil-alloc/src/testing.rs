//! Simulated platform for host tests: physical memory as a frame arena,
//! a ledgered backing allocator, and a scripted entropy source.

use crate::backing::BackingAllocator;
use std::collections::HashMap;
use veil_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_up};
use veil_vmem::{FrameAlloc, PhysMapper};

const PAGE: u64 = Size4K::SIZE;

#[repr(align(4096))]
struct Frame([u8; 4096]);

/// Physical memory as a vector of 4 KiB frames; addresses are byte offsets
/// into the arena. TLB invalidation is a no-op on the host.
pub struct TestPhys {
    frames: Vec<Frame>,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        frames.resize_with(n, || Frame([0; 4096]));
        Self { frames }
    }

    /// Read one byte of "physical" memory.
    pub fn read_byte(&self, pa: PhysicalAddress) -> u8 {
        let idx = (pa.as_u64() >> 12) as usize;
        let off = (pa.as_u64() & 0xFFF) as usize;
        self.frames[idx].0[off]
    }

}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = (pa.as_u64() >> 12) as usize;
        let off = (pa.as_u64() & 0xFFF) as usize;
        let base = std::ptr::from_ref(&self.frames[idx]) as *mut u8;
        // Safety: the arena outlives every test and the offset stays
        // inside the frame by the caller's contract.
        unsafe { &mut *base.add(off).cast::<T>() }
    }

    fn invalidate_tlb(&self, _va: VirtualAddress) {}
}

/// Bump frame source with a free list and an allocation counter.
pub struct TestFrames {
    next: u64,
    end: u64,
    freed: Vec<u64>,
    allocated: usize,
}

impl TestFrames {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end,
            freed: Vec::new(),
            allocated: 0,
        }
    }

    /// Total `alloc_4k` calls that hit the bump pointer (pool growth).
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl FrameAlloc for TestFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if let Some(pa) = self.freed.pop() {
            return Some(PhysicalAddress::new(pa).page::<Size4K>());
        }
        if self.next + PAGE > self.end {
            return None;
        }
        let pa = self.next;
        self.next += PAGE;
        self.allocated += 1;
        Some(PhysicalAddress::new(pa).page::<Size4K>())
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.freed.push(page.base().as_u64());
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Block {
    Bytes(u64),
    Pages(usize),
}

/// Backing allocator over the same synthetic physical space as [`TestPhys`]:
/// a bump allocator with natural block alignment and a full ledger, so
/// tests can assert that the engine returns exactly what it took.
pub struct TestBacking {
    next: u64,
    end: u64,
    ledger: HashMap<u64, Block>,
}

impl TestBacking {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end,
            ledger: HashMap::new(),
        }
    }

    /// Outstanding allocations.
    pub fn outstanding(&self) -> usize {
        self.ledger.len()
    }

    /// Outstanding allocations as a sorted snapshot.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        let mut v: Vec<(u64, u64)> = self
            .ledger
            .iter()
            .map(|(addr, block)| {
                let bytes = match *block {
                    Block::Bytes(b) => align_up(b, PAGE),
                    Block::Pages(order) => PAGE << order,
                };
                (*addr, bytes)
            })
            .collect();
        v.sort_unstable();
        v
    }

    fn carve(&mut self, bytes: u64, align: u64) -> Option<PhysicalAddress> {
        let addr = align_up(self.next, align);
        if addr + bytes > self.end {
            return None;
        }
        self.next = addr + bytes;
        Some(PhysicalAddress::new(addr))
    }
}

impl BackingAllocator for TestBacking {
    fn malloc(&mut self, size: u64) -> Option<PhysicalAddress> {
        let pa = self.carve(align_up(size, PAGE), PAGE)?;
        self.ledger.insert(pa.as_u64(), Block::Bytes(size));
        Some(pa)
    }

    fn calloc(&mut self, nmemb: u64, size: u64) -> Option<PhysicalAddress> {
        self.malloc(nmemb.checked_mul(size)?)
    }

    fn memalign(&mut self, align: u64, size: u64) -> Option<PhysicalAddress> {
        let pa = self.carve(align_up(size, PAGE), align.max(PAGE))?;
        self.ledger.insert(pa.as_u64(), Block::Bytes(size));
        Some(pa)
    }

    fn realloc(&mut self, ptr: PhysicalAddress, new_size: u64) -> Option<PhysicalAddress> {
        match self.ledger.remove(&ptr.as_u64()) {
            Some(Block::Bytes(_)) => self.malloc(new_size),
            other => panic!("realloc of unknown backing block {ptr}: {other:?}"),
        }
    }

    fn free(&mut self, ptr: PhysicalAddress) {
        match self.ledger.remove(&ptr.as_u64()) {
            Some(Block::Bytes(_)) => {}
            other => panic!("free of unknown backing block {ptr}: {other:?}"),
        }
    }

    fn palloc(&mut self, order: usize) -> Option<PhysicalAddress> {
        let bytes = PAGE << order;
        let pa = self.carve(bytes, bytes)?;
        self.ledger.insert(pa.as_u64(), Block::Pages(order));
        Some(pa)
    }

    fn pfree(&mut self, ptr: PhysicalAddress, order: usize) {
        match self.ledger.remove(&ptr.as_u64()) {
            Some(Block::Pages(o)) if o == order => {}
            other => panic!("pfree({ptr}, {order}) does not match ledger: {other:?}"),
        }
    }

    fn available_bytes(&self) -> u64 {
        self.end - self.next
    }

    fn add_memory(&mut self, base: PhysicalAddress, size: u64) -> bool {
        if base.as_u64() == self.end {
            self.end += size;
            return true;
        }
        false
    }
}

/// Entropy source replaying a fixed script, then zeros.
pub struct ScriptedEntropy {
    values: Vec<u64>,
    at: usize,
}

impl ScriptedEntropy {
    pub fn new(values: Vec<u64>) -> Self {
        Self { values, at: 0 }
    }
}

impl crate::rng::EntropySource for ScriptedEntropy {
    fn next_u64(&mut self) -> u64 {
        let v = self.values.get(self.at).copied().unwrap_or(0);
        self.at += 1;
        v
    }
}
