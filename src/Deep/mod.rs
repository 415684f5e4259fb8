// Deep copy of pointer-containing record graphs over a substrate.

pub mod Manifest {
    pub mod Descriptor;
    pub mod Descriptor_impl;
    pub mod layout;
    pub use Descriptor::{CountField, DescriptorKind, ElementLayout, TransportDescriptor}; // re-export for stable path
    pub use Descriptor_impl::default_align;
    pub use layout::RecordLayout;
}
pub mod Structs {
    pub mod Wire_Structs;
    pub use Wire_Structs::{LengthHeader, ManifestPreamble, HEADER_LEN, PREAMBLE_LEN, PREAMBLE_MAGIC};
}

pub mod builder;
mod cursor;
pub mod message;
pub mod transfer;

pub use builder::{LengthMode, MessageBuilder, MessageConfig};
pub use message::{Message, MessageState, Opaque, RootBuilder, RootId};
pub use transfer::{Direction, Transfer};
