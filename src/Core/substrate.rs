// Messaging substrate boundary
// The deep-copy layer only ever asks a substrate to move N bytes to or from a peer.

use std::fmt::Debug;
use std::ptr::NonNull;

use crate::error::{SubstrateError, SubstrateResult};

/// Identifier of a peer process/endpoint on the substrate.
pub type Rank = u32;

/// Message channel (tag). Transfers on one channel between two peers are FIFO.
pub type Channel = u32;

/// Result of a length probe on the next pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The next message on the route carries this many bytes.
    Ready(usize),
    /// Nothing has arrived yet (non-blocking probe only).
    Pending,
    /// The substrate cannot report lengths ahead of a receive.
    Unsupported,
}

/// Handle for an outstanding non-blocking transfer.
pub trait Request {
    /// Returns `Ok(true)` once the transfer has completed.
    fn test(&mut self) -> SubstrateResult<bool>;

    /// Block until the transfer has completed.
    fn wait(&mut self) -> SubstrateResult<()>;

    /// Abandon the transfer. The buffer may be released afterwards.
    fn cancel(&mut self) {}
}

/// A request that completed when it was posted.
#[derive(Debug, Default)]
pub struct Completed;

impl Request for Completed {
    fn test(&mut self) -> SubstrateResult<bool> {
        Ok(true)
    }

    fn wait(&mut self) -> SubstrateResult<()> {
        Ok(())
    }
}

/// Point-to-point byte transport consumed by deep-copy messages.
///
/// Implementations provide reliable, ordered delivery per `(peer, channel)`.
/// Only `transmit` and `receive_into` are required; the non-blocking variants
/// default to the blocking calls and return an already completed request.
pub trait Substrate: Debug {
    /// Send `buf` to `peer` on `channel`.
    fn transmit(&self, buf: &[u8], peer: Rank, channel: Channel) -> SubstrateResult<()>;

    /// Receive exactly `buf.len()` bytes from `peer` on `channel`.
    fn receive_into(&self, buf: &mut [u8], peer: Rank, channel: Channel) -> SubstrateResult<()>;

    /// Blocking length probe of the next message. Never returns `Pending`.
    fn probe(&self, _peer: Rank, _channel: Channel) -> SubstrateResult<ProbeStatus> {
        Ok(ProbeStatus::Unsupported)
    }

    /// Non-blocking length probe.
    fn iprobe(&self, peer: Rank, channel: Channel) -> SubstrateResult<ProbeStatus> {
        self.probe(peer, channel)
    }

    /// Bytes still deliverable, for substrates backed by a finite buffer.
    fn available(&self) -> Option<usize> {
        None
    }

    /// Start sending `len` bytes at `buf`.
    ///
    /// # Safety
    /// `buf..buf+len` must stay valid and unmoved until the returned request
    /// has completed, been cancelled, or been dropped.
    unsafe fn itransmit<'s>(
        &'s self,
        buf: *const u8,
        len: usize,
        peer: Rank,
        channel: Channel,
    ) -> SubstrateResult<Box<dyn Request + 's>> {
        self.transmit(raw_slice(buf, len), peer, channel)?;
        Ok(Box::new(Completed))
    }

    /// Start receiving `len` bytes into `buf`.
    ///
    /// # Safety
    /// `buf..buf+len` must stay valid, writable and unmoved until the returned
    /// request has completed, been cancelled, or been dropped.
    unsafe fn ireceive_into<'s>(
        &'s self,
        buf: *mut u8,
        len: usize,
        peer: Rank,
        channel: Channel,
    ) -> SubstrateResult<Box<dyn Request + 's>> {
        self.receive_into(raw_slice_mut(buf, len), peer, channel)?;
        Ok(Box::new(Completed))
    }
}

impl<S: Substrate + ?Sized> Substrate for &S {
    fn transmit(&self, buf: &[u8], peer: Rank, channel: Channel) -> SubstrateResult<()> {
        (**self).transmit(buf, peer, channel)
    }

    fn receive_into(&self, buf: &mut [u8], peer: Rank, channel: Channel) -> SubstrateResult<()> {
        (**self).receive_into(buf, peer, channel)
    }

    fn probe(&self, peer: Rank, channel: Channel) -> SubstrateResult<ProbeStatus> {
        (**self).probe(peer, channel)
    }

    fn iprobe(&self, peer: Rank, channel: Channel) -> SubstrateResult<ProbeStatus> {
        (**self).iprobe(peer, channel)
    }

    fn available(&self) -> Option<usize> {
        (**self).available()
    }

    unsafe fn itransmit<'s>(
        &'s self,
        buf: *const u8,
        len: usize,
        peer: Rank,
        channel: Channel,
    ) -> SubstrateResult<Box<dyn Request + 's>> {
        (**self).itransmit(buf, len, peer, channel)
    }

    unsafe fn ireceive_into<'s>(
        &'s self,
        buf: *mut u8,
        len: usize,
        peer: Rank,
        channel: Channel,
    ) -> SubstrateResult<Box<dyn Request + 's>> {
        (**self).ireceive_into(buf, len, peer, channel)
    }
}

/// Build a slice from a raw range; zero-length ranges may carry a null pointer.
///
/// # Safety
/// For `len > 0`, `ptr..ptr+len` must be valid for reads for `'a`.
pub unsafe fn raw_slice<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    std::slice::from_raw_parts(ptr, len)
}

/// Mutable counterpart of [`raw_slice`].
///
/// # Safety
/// For `len > 0`, `ptr..ptr+len` must be valid for writes for `'a` and not aliased.
pub unsafe fn raw_slice_mut<'a>(ptr: *mut u8, len: usize) -> &'a mut [u8] {
    if len == 0 {
        return std::slice::from_raw_parts_mut(NonNull::<u8>::dangling().as_ptr(), 0);
    }
    std::slice::from_raw_parts_mut(ptr, len)
}

/// Reject a receive whose buffer length disagrees with the incoming message.
pub(crate) fn check_len(channel: Channel, expected: usize, actual: usize) -> SubstrateResult<()> {
    if expected != actual {
        return Err(SubstrateError::Truncated {
            channel,
            expected,
            actual,
        });
    }
    Ok(())
}
