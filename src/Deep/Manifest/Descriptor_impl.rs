use std::mem::{align_of, size_of};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::layout::RecordLayout;
use super::Descriptor::{CountField, DescriptorKind, ElementLayout, TransportDescriptor};
use crate::error::{DeepCopyError, DeepResult};

/// Alignment assumed for an element of `element_size` bytes when no type is known:
/// the largest power of two dividing the size, capped at 16.
pub fn default_align(element_size: usize) -> usize {
    if element_size == 0 {
        return 1;
    }
    (1usize << element_size.trailing_zeros()).min(16)
}

impl TransportDescriptor {
    fn new(kind: DescriptorKind, offset: usize, element_size: usize, count: usize) -> Self {
        Self {
            offset,
            element_size,
            element_align: default_align(element_size),
            count,
            count_field: None,
            kind,
            element_layout: ElementLayout::Flat,
            owns_allocation: false,
        }
    }

    /// Scalar or array embedded in the record at `offset`.
    pub fn inline(offset: usize, element_size: usize, count: usize) -> Self {
        Self::new(DescriptorKind::Inline, offset, element_size, count)
    }

    /// Pointer field at `offset` whose target holds `count` elements of `element_size` bytes.
    pub fn indirection(offset: usize, element_size: usize, count: usize) -> Self {
        Self::new(DescriptorKind::Indirection, offset, element_size, count)
    }

    pub fn inline_of<T>(offset: usize, count: usize) -> Self {
        Self::inline(offset, size_of::<T>(), count).with_align(align_of::<T>())
    }

    pub fn indirection_of<T>(offset: usize, count: usize) -> Self {
        Self::indirection(offset, size_of::<T>(), count).with_align(align_of::<T>())
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.element_align = align;
        self
    }

    pub fn with_count_field(mut self, field: CountField) -> Self {
        self.count_field = Some(field);
        self
    }

    pub fn with_element_layout(mut self, layout: Arc<RecordLayout>) -> Self {
        self.element_layout = ElementLayout::Layout(layout);
        self
    }

    /// Elements of the target are records of the same type as the holder.
    pub fn with_self_layout(mut self) -> Self {
        self.element_layout = ElementLayout::SelfLayout;
        self
    }

    pub fn is_inline(&self) -> bool {
        self.kind == DescriptorKind::Inline
    }

    pub fn is_indirection(&self) -> bool {
        self.kind == DescriptorKind::Indirection
    }

    /// Bytes covered by `count` elements, `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_size.checked_mul(self.count)
    }

    /// Check that the descriptor fits a record of `record_size` bytes aligned to `record_align`.
    pub(crate) fn validate(&self, record_size: usize, record_align: usize) -> DeepResult<()> {
        if !self.element_align.is_power_of_two() {
            return Err(DeepCopyError::invalid(format!(
                "element alignment {} at offset {} is not a power of two",
                self.element_align, self.offset
            )));
        }
        match self.kind {
            DescriptorKind::Inline => {
                let end = self
                    .byte_len()
                    .and_then(|len| len.checked_add(self.offset))
                    .ok_or_else(|| DeepCopyError::invalid("inline field length overflows"))?;
                if end > record_size {
                    return Err(DeepCopyError::invalid(format!(
                        "inline field [{}, {}) exceeds record of {} bytes",
                        self.offset, end, record_size
                    )));
                }
            }
            DescriptorKind::Indirection => {
                let end = self
                    .offset
                    .checked_add(size_of::<*mut u8>())
                    .ok_or_else(|| DeepCopyError::invalid("pointer slot offset overflows"))?;
                if end > record_size {
                    return Err(DeepCopyError::invalid(format!(
                        "pointer slot at offset {} exceeds record of {} bytes",
                        self.offset, record_size
                    )));
                }
                if record_align >= align_of::<*mut u8>()
                    && self.offset % align_of::<*mut u8>() != 0
                {
                    return Err(DeepCopyError::invalid(format!(
                        "pointer slot at offset {} is misaligned",
                        self.offset
                    )));
                }
                if self.element_size == 0 {
                    return Err(DeepCopyError::invalid(format!(
                        "indirection at offset {} has zero-sized elements",
                        self.offset
                    )));
                }
            }
        }
        if let Some(field) = self.count_field {
            let end = field
                .offset()
                .checked_add(field.width())
                .ok_or_else(|| DeepCopyError::invalid("count field offset overflows"))?;
            if end > record_size {
                return Err(DeepCopyError::invalid(format!(
                    "count field at offset {} exceeds record of {} bytes",
                    field.offset(),
                    record_size
                )));
            }
        }
        match &self.element_layout {
            ElementLayout::Flat => {}
            _ if self.is_inline() => {
                return Err(DeepCopyError::invalid(format!(
                    "inline field at offset {} cannot carry an element layout",
                    self.offset
                )));
            }
            ElementLayout::Layout(layout) if layout.size() != self.element_size => {
                return Err(DeepCopyError::invalid(format!(
                    "element layout {} is {} bytes, descriptor says {}",
                    layout.name(),
                    layout.size(),
                    self.element_size
                )));
            }
            ElementLayout::Layout(layout) => layout.validate()?,
            ElementLayout::SelfLayout if record_size != self.element_size => {
                return Err(DeepCopyError::invalid(format!(
                    "self layout element of {} bytes in a record of {} bytes",
                    self.element_size, record_size
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Element count a sender transmits for the pointer field of `record`.
    ///
    /// # Safety
    /// `record` must point to a live record this descriptor was validated against.
    pub(crate) unsafe fn live_count(&self, record: *const u8) -> usize {
        match self.count_field {
            Some(field) => field.read(record),
            None => self.count,
        }
    }

    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update([self.kind as u8]);
        hasher.update((self.offset as u64).to_le_bytes());
        hasher.update((self.element_size as u64).to_le_bytes());
        hasher.update((self.element_align as u64).to_le_bytes());
        match self.count_field {
            Some(field) => {
                hasher.update([1, field.width() as u8]);
                hasher.update((field.offset() as u64).to_le_bytes());
            }
            None => hasher.update([0]),
        }
        match &self.element_layout {
            ElementLayout::Flat => hasher.update([0]),
            ElementLayout::Layout(layout) => {
                hasher.update([1]);
                layout.digest_into(hasher);
            }
            ElementLayout::SelfLayout => hasher.update([2]),
        }
    }
}

impl CountField {
    pub fn offset(self) -> usize {
        match self {
            CountField::I32(offset)
            | CountField::U32(offset)
            | CountField::I64(offset)
            | CountField::U64(offset)
            | CountField::Usize(offset) => offset,
        }
    }

    pub fn width(self) -> usize {
        match self {
            CountField::I32(_) | CountField::U32(_) => 4,
            CountField::I64(_) | CountField::U64(_) => 8,
            CountField::Usize(_) => size_of::<usize>(),
        }
    }

    /// Read the count from `record`; negative values read as zero.
    ///
    /// # Safety
    /// `record + offset .. + width` must be readable.
    pub(crate) unsafe fn read(self, record: *const u8) -> usize {
        let at = record.add(self.offset());
        match self {
            CountField::I32(_) => (at as *const i32).read_unaligned().max(0) as usize,
            CountField::U32(_) => (at as *const u32).read_unaligned() as usize,
            CountField::I64(_) => (at as *const i64).read_unaligned().max(0) as usize,
            CountField::U64(_) => (at as *const u64).read_unaligned() as usize,
            CountField::Usize(_) => (at as *const usize).read_unaligned(),
        }
    }
}
