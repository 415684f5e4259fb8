use std::fmt;

use crate::Core::alloc::{AllocationTracker, TrackedAllocation};
use crate::Core::fabric::{Endpoint, LocalFabric};
use crate::Deep::Message;

/// Debug function for AllocationTracker
///
/// Shows entry count and lifetime counters without listing every block
pub fn debug_allocation_tracker(tracker: &AllocationTracker, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stats = tracker.stats();
    f.debug_struct("AllocationTracker")
        .field("entries", &tracker.len())
        .field("live_bytes", &stats.live_bytes)
        .field("recorded", &stats.recorded)
        .field("released", &stats.released)
        .finish()
}

/// Debug function for TrackedAllocation
pub fn debug_tracked_allocation(entry: &TrackedAllocation, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TrackedAllocation")
        .field("ptr", &format_args!("{:p}", entry.as_ptr()))
        .field("len", &entry.len())
        .field("align", &entry.align())
        .field("ordinal", &entry.ordinal())
        .finish()
}

/// Debug function for Endpoint
///
/// Mailbox contents are shared with every other endpoint and are not shown
pub fn debug_endpoint(endpoint: &Endpoint, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
        .field("rank", &endpoint.rank())
        .field("ranks", &endpoint.fabric.ranks)
        .finish_non_exhaustive()
}

/// Debug function for LocalFabric
pub fn debug_local_fabric(fabric: &LocalFabric, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalFabric")
        .field("ranks", &fabric.ranks())
        .field("pending_messages", &fabric.pending_messages())
        .field("messages_sent", &fabric.messages_sent())
        .field("bytes_sent", &fabric.bytes_sent())
        .finish()
}

/// Debug function for Message
///
/// Root records are opaque here; only their addresses and manifest sizes are shown
pub fn debug_message(message: &Message<'_>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let roots: Vec<_> = message
        .roots
        .iter()
        .map(|root| {
            format!(
                "{}@{:p}[{}]",
                root.layout.name(),
                root.record,
                root.layout.descriptor_count()
            )
        })
        .collect();
    f.debug_struct("Message")
        .field("state", &message.state())
        .field("roots", &roots)
        .field("config", message.config())
        .field("tracker", message.tracker())
        .finish()
}
