// Fixed-size control records exchanged ahead of payloads.
// Both peers share one memory layout, so these go over the wire as raw native-endian bytes.

use std::mem::size_of;

/// "DMXP_DPC"
pub const PREAMBLE_MAGIC: u64 = 0x444D58505F445043;

pub const HEADER_LEN: usize = size_of::<LengthHeader>();
pub const PREAMBLE_LEN: usize = size_of::<ManifestPreamble>();

/// Announces the length of one indirection payload.
/// A `count` of zero is the null/empty sentinel: no payload follows.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LengthHeader {
    /// Replay position of the descriptor this payload belongs to.
    pub ordinal: u64,
    pub count: u64,
    pub element_size: u64,
}

/// Optional manifest check sent before the first transfer of a message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestPreamble {
    pub magic: u64,
    pub roots: u32,
    /// Root-level descriptors across all roots.
    pub descriptors: u32,
    /// First eight bytes of the SHA-256 layout digest.
    pub fingerprint: u64,
}

macro_rules! wire_bytes {
    ($ty:ty, $len:expr) => {
        impl $ty {
            pub fn to_bytes(&self) -> [u8; $len] {
                // Safety: repr(C), only integer fields, no padding.
                unsafe { std::mem::transmute_copy(self) }
            }

            pub fn from_bytes(bytes: &[u8; $len]) -> Self {
                // Safety: every bit pattern is a valid value of these integer fields.
                unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
            }
        }
    };
}

wire_bytes!(LengthHeader, HEADER_LEN);
wire_bytes!(ManifestPreamble, PREAMBLE_LEN);
