pub mod alloc;
pub mod fabric;
pub mod packed;
pub mod substrate;

pub use alloc::{AllocationTracker, RawAllocation, TrackedAllocation, TrackerStats};
pub use fabric::{Endpoint, FabricBuilder, LocalFabric};
pub use packed::{PackReader, PackWriter, SizeCounter};
pub use substrate::{Channel, ProbeStatus, Rank, Request, Substrate};
