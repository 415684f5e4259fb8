use super::*;

/// Read-only accessors used by tests, the C ABI and the Debug proxies.
impl AllocationTracker {
    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Bytes currently owned by the tracker.
    pub fn live_bytes(&self) -> usize {
        self.stats.live_bytes
    }

    /// Iterate over the live entries in the order they were recorded.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedAllocation> {
        self.entries.iter()
    }

    /// Whether `ptr` is the start of an allocation this tracker owns.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.entries.iter().any(|e| e.ptr.as_ptr() as *const u8 == ptr)
    }
}

impl TrackedAllocation {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Replay position of the descriptor this allocation satisfied.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}
