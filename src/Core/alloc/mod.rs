use std::alloc::Layout;
use std::ptr::NonNull;
mod debug;
mod getters;

/// Largest alignment the tracker will honour for a receive-side allocation.
pub const MAX_ALIGN: usize = 4096;

/// A receive-side allocation that has not been handed to a tracker yet.
///
/// Dropping it frees the memory, so a payload transfer that fails between
/// allocation and recording never leaks and never produces a tracker entry.
pub struct RawAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
    ordinal: usize,
}

impl RawAllocation {
    /// Allocate `size` bytes aligned to `align` for descriptor `ordinal`.
    ///
    /// Returns `None` for an invalid layout, a zero size, or when the global
    /// allocator cannot satisfy the request.
    pub fn new(size: usize, align: usize, ordinal: usize) -> Option<Self> {
        if size == 0 || align > MAX_ALIGN {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // Safety: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        Some(Self {
            ptr,
            layout,
            ordinal,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl Drop for RawAllocation {
    fn drop(&mut self) {
        // Safety: allocated in `new` with exactly this layout and not yet freed.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One allocation owned by a tracker.
pub struct TrackedAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
    ordinal: usize,
}

/// Lifetime counters of a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Allocations recorded since creation.
    pub recorded: usize,
    /// Allocations freed since creation.
    pub released: usize,
    /// Bytes currently held.
    pub live_bytes: usize,
}

/// Owner of every allocation a message made while reconstructing indirections.
///
/// Entries are freed together by [`release_all`](Self::release_all), which also
/// runs on drop. A tracker is never shared: two messages describing
/// overlapping graphs still each own a separate tracker.
#[derive(Default)]
pub struct AllocationTracker {
    entries: Vec<TrackedAllocation>,
    stats: TrackerStats,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate memory for descriptor `ordinal` without recording it yet.
    pub fn allocate(&self, size: usize, align: usize, ordinal: usize) -> Option<RawAllocation> {
        RawAllocation::new(size, align, ordinal)
    }

    /// Take ownership of `allocation` and return its address.
    pub fn record(&mut self, allocation: RawAllocation) -> *mut u8 {
        let allocation = std::mem::ManuallyDrop::new(allocation);
        let entry = TrackedAllocation {
            ptr: allocation.ptr,
            layout: allocation.layout,
            ordinal: allocation.ordinal,
        };
        self.stats.recorded += 1;
        self.stats.live_bytes += entry.layout.size();
        log::trace!(
            "AllocationTracker::record: descriptor #{} -> {} bytes at {:p}",
            entry.ordinal,
            entry.layout.size(),
            entry.ptr
        );
        let ptr = entry.ptr.as_ptr();
        self.entries.push(entry);
        ptr
    }

    /// Free every recorded allocation. Returns how many were freed; a second
    /// call frees nothing and returns 0.
    pub fn release_all(&mut self) -> usize {
        let freed = self.entries.len();
        for entry in self.entries.drain(..) {
            // Safety: each entry came from RawAllocation::new with this layout
            // and is removed from the tracker as it is freed.
            unsafe { std::alloc::dealloc(entry.ptr.as_ptr(), entry.layout) };
        }
        self.stats.released += freed;
        self.stats.live_bytes = 0;
        freed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        self.release_all();
    }
}

// Entries are plain heap blocks with a single owner.
unsafe impl Send for AllocationTracker {}
unsafe impl Send for RawAllocation {}
