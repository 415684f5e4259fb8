use std::mem::{align_of, size_of};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::Descriptor::TransportDescriptor;
use crate::error::DeepResult;

/// Explicit description of one record type: its size, alignment and the
/// descriptors replayed for every instance.
///
/// Layouts are built per type by hand (there is no global registry) and
/// shared through `Arc` as the element layout of indirections:
///
/// ```ignore
/// let node = RecordLayout::of::<Node>("Node")
///     .nested(TransportDescriptor::indirection_of::<Node>(offset_of!(Node, children), 0)
///         .with_count_field(CountField::U32(offset_of!(Node, n_children)))
///         .with_self_layout())
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    name: &'static str,
    size: usize,
    align: usize,
    fields: Vec<TransportDescriptor>,
}

impl RecordLayout {
    pub fn new(name: &'static str, size: usize, align: usize) -> Self {
        Self {
            name,
            size,
            align,
            fields: Vec::new(),
        }
    }

    pub fn of<T>(name: &'static str) -> Self {
        Self::new(name, size_of::<T>(), align_of::<T>())
    }

    /// Append an inline run of `count` elements of `element_size` bytes.
    pub fn inline(self, offset: usize, element_size: usize, count: usize) -> Self {
        self.nested(TransportDescriptor::inline(offset, element_size, count))
    }

    /// Append a flat indirection. Use [`nested`](Self::nested) for element layouts.
    pub fn indirection(self, offset: usize, element_size: usize, count: usize) -> Self {
        self.nested(TransportDescriptor::indirection(offset, element_size, count))
    }

    /// Append a fully specified descriptor. Checked by [`build`](Self::build).
    pub fn nested(mut self, descriptor: TransportDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }

    pub fn build(self) -> DeepResult<Arc<Self>> {
        self.validate()?;
        Ok(Arc::new(self))
    }

    pub(crate) fn validate(&self) -> DeepResult<()> {
        self.fields
            .iter()
            .try_for_each(|d| d.validate(self.size, self.align))
    }

    pub(crate) fn push(&mut self, descriptor: TransportDescriptor) -> DeepResult<()> {
        descriptor.validate(self.size, self.align)?;
        self.fields.push(descriptor);
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn fields(&self) -> &[TransportDescriptor] {
        &self.fields
    }

    pub(crate) fn fields_mut(&mut self) -> &mut [TransportDescriptor] {
        &mut self.fields
    }

    /// Number of top-level descriptors in this layout.
    pub fn descriptor_count(&self) -> usize {
        self.fields.len()
    }

    /// Structural hash input. Names and counts are not hashed: peers compare shape only.
    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update((self.size as u64).to_le_bytes());
        hasher.update((self.align as u64).to_le_bytes());
        hasher.update((self.fields.len() as u64).to_le_bytes());
        for field in &self.fields {
            field.digest_into(hasher);
        }
    }
}
