// A manifest is an ordered list of TransportDescriptors.
// Both peers replay it in the same order; nothing on the wire says which descriptor a
// transfer belongs to, so order is the whole contract.

use std::sync::Arc;

use super::layout::RecordLayout;

/// How a field travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    /// Bytes that live inside the containing record.
    Inline,
    /// A pointer field whose target is sent as its own unit and reallocated on arrival.
    Indirection,
}

/// Integer field inside the same record that holds an indirection's element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountField {
    I32(usize),
    U32(usize),
    I64(usize),
    U64(usize),
    Usize(usize),
}

/// Layout replayed for each element of an indirection target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ElementLayout {
    /// Elements hold no pointers; the payload is the whole story.
    #[default]
    Flat,
    /// Elements are records described by this layout.
    Layout(Arc<RecordLayout>),
    /// Elements have the same layout as the record holding the pointer.
    SelfLayout,
}

/// One manifest entry: a field of a record and how to move it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    /// Byte offset of the field within its owning record.
    pub offset: usize,
    /// Size of one transmitted element. For indirections this is the target
    /// element, never the pointer itself.
    pub element_size: usize,
    /// Alignment used when the receiver allocates the target.
    pub element_align: usize,
    /// Element count. Receivers overwrite this with the transmitted count.
    pub count: usize,
    /// Where a sender reads the live count, overriding `count`.
    pub count_field: Option<CountField>,
    pub kind: DescriptorKind,
    pub element_layout: ElementLayout,
    /// Receive side only: set once the message allocated memory for this field.
    pub owns_allocation: bool,
}
