use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use super::transfer::{Direction, Transfer};
use super::Manifest::{RecordLayout, TransportDescriptor};
use super::Structs::{ManifestPreamble, PREAMBLE_MAGIC};
use super::{LengthMode, MessageBuilder, MessageConfig};
use crate::Core::alloc::AllocationTracker;
use crate::Core::packed::{PackReader, PackWriter, SizeCounter};
use crate::Core::substrate::{Channel, Rank, Substrate};
use crate::error::{DeepCopyError, DeepResult};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Accepting roots and descriptors.
    Open,
    InFlight,
    Completed,
    /// A transfer failed or was cancelled. The message can only be released.
    Failed,
    Released,
}

/// Record type of roots registered through raw pointers.
#[repr(C)]
pub struct Opaque {
    _private: [u8; 0],
}

pub(crate) struct Root {
    pub record: NonNull<u8>,
    pub layout: RecordLayout,
}

/// Typed handle to a root of one particular message.
pub struct RootId<R> {
    message: u64,
    index: usize,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for RootId<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for RootId<R> {}

impl<R> std::fmt::Debug for RootId<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootId")
            .field("message", &self.message)
            .field("index", &self.index)
            .finish()
    }
}

impl<R> RootId<R> {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A deep-copy message: an ordered set of root records, the manifest
/// describing each, and the allocations made while receiving into them.
///
/// The same manifest drives both sides. A sender registers its populated
/// records, a receiver registers destination records with an identical
/// manifest; after `receive` every indirection of the destination points at
/// fresh memory owned by this message until [`release`](Self::release).
///
/// ```ignore
/// let mut msg = Message::new();
/// let root = msg
///     .add_root(&mut record)?
///     .add_inline_of::<i32>(offset_of!(Rec, a), 1)?
///     .add_nested(TransportDescriptor::indirection_of::<i32>(offset_of!(Rec, arr), 0)
///         .with_count_field(CountField::I32(offset_of!(Rec, arr_len))))?
///     .add_inline_of::<i32>(offset_of!(Rec, arr_len), 1)?
///     .id();
/// msg.send(&endpoint, 1, 7)?;
/// ```
pub struct Message<'a> {
    pub(crate) roots: Vec<Root>,
    pub(crate) tracker: AllocationTracker,
    pub(crate) config: MessageConfig,
    pub(crate) state: MessageState,
    id: u64,
    _records: PhantomData<&'a mut ()>,
}

impl Default for Message<'_> {
    fn default() -> Self {
        Self::with_config(MessageConfig::default())
    }
}

impl<'a> Message<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    pub fn with_config(config: MessageConfig) -> Self {
        Self {
            roots: Vec::new(),
            tracker: AllocationTracker::new(),
            config,
            state: MessageState::Open,
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            _records: PhantomData,
        }
    }

    /// Register `record` as the next root. Descriptors added through the
    /// returned builder (or the message-level `add_*` calls) apply to it.
    pub fn add_root<'m, R>(&'m mut self, record: &'a mut R) -> DeepResult<RootBuilder<'m, 'a, R>> {
        let layout = RecordLayout::of::<R>(std::any::type_name::<R>());
        self.push_root(NonNull::from(record).cast(), layout)
    }

    /// Register a root by address.
    ///
    /// # Safety
    /// `record` must point to `size` bytes aligned to `align` that stay valid,
    /// and are accessed only through this message, for `'a`.
    pub unsafe fn add_raw_root<'m>(
        &'m mut self,
        record: *mut u8,
        size: usize,
        align: usize,
    ) -> DeepResult<RootBuilder<'m, 'a, Opaque>> {
        let record = NonNull::new(record).ok_or_else(|| DeepCopyError::invalid("null root record"))?;
        if !align.is_power_of_two() || record.as_ptr() as usize % align != 0 {
            return Err(DeepCopyError::invalid(format!(
                "root at {:p} is not aligned to {}",
                record, align
            )));
        }
        self.push_root(record, RecordLayout::new("raw", size, align))
    }

    fn push_root<'m, R>(
        &'m mut self,
        record: NonNull<u8>,
        layout: RecordLayout,
    ) -> DeepResult<RootBuilder<'m, 'a, R>> {
        self.ensure_open()?;
        let index = self.roots.len();
        self.roots.push(Root { record, layout });
        Ok(RootBuilder {
            id: RootId {
                message: self.id,
                index,
                _record: PhantomData,
            },
            message: self,
        })
    }

    /// Append an Inline descriptor to the last root.
    pub fn add_inline(&mut self, offset: usize, element_size: usize, count: usize) -> DeepResult<()> {
        self.add_nested(TransportDescriptor::inline(offset, element_size, count))
    }

    /// Append an Indirection descriptor to the last root.
    pub fn add_indirection(
        &mut self,
        offset: usize,
        element_size: usize,
        count: usize,
    ) -> DeepResult<()> {
        self.add_nested(TransportDescriptor::indirection(offset, element_size, count))
    }

    /// Append a fully specified descriptor to the last root.
    pub fn add_nested(&mut self, descriptor: TransportDescriptor) -> DeepResult<()> {
        let index = self
            .roots
            .len()
            .checked_sub(1)
            .ok_or_else(|| DeepCopyError::invalid("descriptor added before any root"))?;
        self.push_descriptor(index, descriptor)
    }

    fn push_descriptor(&mut self, root: usize, descriptor: TransportDescriptor) -> DeepResult<()> {
        self.ensure_open()?;
        self.roots[root].layout.push(descriptor)
    }

    fn ensure_open(&self) -> DeepResult<()> {
        match self.state {
            MessageState::Open => Ok(()),
            state => Err(DeepCopyError::InvalidState(state)),
        }
    }

    fn root<R>(&self, id: RootId<R>) -> Option<&Root> {
        if id.message != self.id {
            return None;
        }
        self.roots.get(id.index)
    }

    /// Shared access to a registered root record.
    pub fn record<R>(&self, id: RootId<R>) -> Option<&R> {
        let root = self.root(id)?;
        // Safety: the record was registered from a `&'a mut R` held for 'a and
        // no transfer is running while `self` is borrowed.
        Some(unsafe { root.record.cast::<R>().as_ref() })
    }

    pub fn record_mut<R>(&mut self, id: RootId<R>) -> Option<&mut R> {
        let root = self.root(id)?;
        // Safety: as for `record`, with `self` borrowed exclusively.
        Some(unsafe { root.record.cast::<R>().as_mut() })
    }

    /// Descriptors of a root. After a receive their counts hold the transmitted counts.
    pub fn descriptors<R>(&self, id: RootId<R>) -> Option<&[TransportDescriptor]> {
        self.root(id).map(|root| root.layout.fields())
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Root-level descriptors across every root.
    pub fn descriptor_count(&self) -> usize {
        self.roots.iter().map(|root| root.layout.descriptor_count()).sum()
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn config(&self) -> &MessageConfig {
        &self.config
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    /// Structural fingerprint of the manifest. Peers with equal fingerprints
    /// replay identical transfer sequences.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update((self.roots.len() as u64).to_le_bytes());
        for root in &self.roots {
            root.layout.digest_into(&mut hasher);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }

    pub fn preamble(&self) -> ManifestPreamble {
        ManifestPreamble {
            magic: PREAMBLE_MAGIC,
            roots: self.roots.len() as u32,
            descriptors: self.descriptor_count() as u32,
            fingerprint: self.fingerprint(),
        }
    }

    /// Start sending every root to `peer` on `channel`.
    pub fn isend<'m, 's>(
        &'m mut self,
        substrate: &'s dyn Substrate,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<Transfer<'m, 'a, 's>> {
        Transfer::start(self, substrate, Direction::Send, peer, channel)
    }

    pub fn send(&mut self, substrate: &dyn Substrate, peer: Rank, channel: Channel) -> DeepResult<()> {
        self.isend(substrate, peer, channel)?.wait()
    }

    /// Start receiving into every root from `peer` on `channel`.
    pub fn ireceive<'m, 's>(
        &'m mut self,
        substrate: &'s dyn Substrate,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<Transfer<'m, 'a, 's>> {
        Transfer::start(self, substrate, Direction::Receive, peer, channel)
    }

    pub fn receive(
        &mut self,
        substrate: &dyn Substrate,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<()> {
        self.ireceive(substrate, peer, channel)?.wait()
    }

    /// Bytes a buffered send of this message will pack. Leaves the message `Open`.
    pub fn packed_size(&mut self) -> DeepResult<usize> {
        self.ensure_open()?;
        let counter = SizeCounter::new();
        let sent = self.prefix_framed(|message| message.send(&counter, 0, 0));
        self.state = MessageState::Open;
        sent.map(|()| counter.bytes())
    }

    /// Pack the whole message into one buffer and send it as a `u64` length
    /// followed by the buffer.
    pub fn send_buffered(
        &mut self,
        substrate: &dyn Substrate,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<()> {
        let size = self.packed_size()?;
        let writer = PackWriter::with_capacity(size);
        self.prefix_framed(|message| message.send(&writer, 0, 0))?;
        let buffer = writer.into_inner();
        log::debug!(
            "Message::send_buffered: {} bytes to peer {} on channel {}",
            buffer.len(),
            peer,
            channel
        );
        let sent = substrate
            .transmit(&(buffer.len() as u64).to_ne_bytes(), peer, channel)
            .and_then(|()| substrate.transmit(&buffer, peer, channel));
        if let Err(source) = sent {
            self.state = MessageState::Failed;
            return Err(DeepCopyError::from_substrate(0, source));
        }
        Ok(())
    }

    /// Receive a buffer produced by [`send_buffered`](Self::send_buffered) and
    /// replay the manifest from it.
    pub fn receive_buffered(
        &mut self,
        substrate: &dyn Substrate,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<()> {
        self.ensure_open()?;
        let result = self.receive_packed(substrate, peer, channel);
        if result.is_err() && self.state != MessageState::Released {
            self.state = MessageState::Failed;
        }
        result
    }

    fn receive_packed(
        &mut self,
        substrate: &dyn Substrate,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<()> {
        let mut len = [0u8; 8];
        substrate
            .receive_into(&mut len, peer, channel)
            .map_err(|source| DeepCopyError::from_substrate(0, source))?;
        let len = u64::from_ne_bytes(len) as usize;
        if len > self.config.max_allocation {
            return Err(DeepCopyError::AllocationFailure {
                ordinal: 0,
                size: len,
                align: 1,
            });
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| DeepCopyError::AllocationFailure {
                ordinal: 0,
                size: len,
                align: 1,
            })?;
        buffer.resize(len, 0);
        substrate
            .receive_into(&mut buffer, peer, channel)
            .map_err(|source| DeepCopyError::from_substrate(0, source))?;
        log::debug!(
            "Message::receive_buffered: {} bytes from peer {} on channel {}",
            len,
            peer,
            channel
        );

        let reader = PackReader::new(buffer);
        self.prefix_framed(|message| message.receive(&reader, 0, 0))?;
        match reader.remaining() {
            0 => Ok(()),
            trailing => Err(DeepCopyError::mismatch(
                self.descriptor_count(),
                format!("{trailing} bytes left over after the last descriptor"),
            )),
        }
    }

    /// Packed buffers carry no message boundaries, so they always use length headers.
    fn prefix_framed<T>(&mut self, f: impl FnOnce(&mut Self) -> DeepResult<T>) -> DeepResult<T> {
        let mode = std::mem::replace(&mut self.config.length_mode, LengthMode::Prefix);
        let result = f(self);
        self.config.length_mode = mode;
        result
    }

    /// Free every allocation made while receiving and null the root pointer
    /// fields that referred to them. Returns how many allocations were freed;
    /// releasing twice frees nothing the second time.
    pub fn release(&mut self) -> usize {
        for root in &mut self.roots {
            let record = root.record.as_ptr();
            for descriptor in root.layout.fields_mut() {
                if descriptor.owns_allocation {
                    // Safety: a validated pointer slot inside a record borrowed for 'a.
                    unsafe {
                        (record.add(descriptor.offset) as *mut *mut u8).write_unaligned(ptr::null_mut())
                    };
                    descriptor.owns_allocation = false;
                }
            }
        }
        let freed = self.tracker.release_all();
        if self.state != MessageState::Released {
            log::debug!(
                "Message::release: freed {} allocations, {} roots",
                freed,
                self.roots.len()
            );
        }
        self.state = MessageState::Released;
        freed
    }
}

impl Drop for Message<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_message(self, f)
    }
}

/// Adds descriptors to one root of a message.
pub struct RootBuilder<'m, 'a, R> {
    message: &'m mut Message<'a>,
    id: RootId<R>,
}

impl<'m, 'a, R> RootBuilder<'m, 'a, R> {
    pub fn id(&self) -> RootId<R> {
        self.id
    }

    pub fn add_inline(&mut self, offset: usize, element_size: usize, count: usize) -> DeepResult<&mut Self> {
        self.add_nested(TransportDescriptor::inline(offset, element_size, count))
    }

    pub fn add_indirection(
        &mut self,
        offset: usize,
        element_size: usize,
        count: usize,
    ) -> DeepResult<&mut Self> {
        self.add_nested(TransportDescriptor::indirection(offset, element_size, count))
    }

    pub fn add_inline_of<T>(&mut self, offset: usize, count: usize) -> DeepResult<&mut Self> {
        self.add_nested(TransportDescriptor::inline_of::<T>(offset, count))
    }

    pub fn add_indirection_of<T>(&mut self, offset: usize, count: usize) -> DeepResult<&mut Self> {
        self.add_nested(TransportDescriptor::indirection_of::<T>(offset, count))
    }

    pub fn add_nested(&mut self, descriptor: TransportDescriptor) -> DeepResult<&mut Self> {
        self.message.push_descriptor(self.id.index, descriptor)?;
        Ok(self)
    }

    /// Append every descriptor of a prebuilt layout for the same record type.
    pub fn add_layout(&mut self, layout: &RecordLayout) -> DeepResult<&mut Self> {
        let root = &self.message.roots[self.id.index].layout;
        if layout.size() != root.size() || layout.align() != root.align() {
            return Err(DeepCopyError::invalid(format!(
                "layout {} ({} bytes, align {}) does not describe a {}-byte root",
                layout.name(),
                layout.size(),
                layout.align(),
                root.size()
            )));
        }
        for descriptor in layout.fields() {
            self.message.push_descriptor(self.id.index, descriptor.clone())?;
        }
        Ok(self)
    }
}
