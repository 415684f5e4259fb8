// Resumable send/receive of one message.
//
// A Transfer replays the manifest against a substrate with at most one request in flight.
// Blocking send/receive run it to completion with wait(); the non-blocking variants hand
// it to the caller, who advances it with test(). The transfer mutably borrows its message,
// so record memory, staging buffers and pending allocations stay put while a request
// points into them.

use std::ptr;
use std::sync::Arc;

use crossbeam_utils::Backoff;

use super::cursor::{IndirectionOp, ManifestCursor, Op};
use super::Structs::{LengthHeader, ManifestPreamble, HEADER_LEN, PREAMBLE_LEN};
use super::{LengthMode, Message, MessageState};
use crate::Core::alloc::RawAllocation;
use crate::Core::substrate::{raw_slice, Channel, ProbeStatus, Rank, Request, Substrate};
use crate::error::{DeepCopyError, DeepResult, SubstrateError};

const CONTROL_LEN: usize = if HEADER_LEN > PREAMBLE_LEN {
    HEADER_LEN
} else {
    PREAMBLE_LEN
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

enum Stage {
    /// Nothing in flight; the next manifest step is posted on the next drive.
    Ready,
    Preamble,
    InlineRun {
        root: usize,
        start: usize,
        end: usize,
        ordinal: usize,
    },
    Header(IndirectionOp),
    /// Receive in probe mode, waiting for the payload length.
    Probe(IndirectionOp),
    Payload(IndirectionOp),
    Finished,
    Failed,
}

impl Stage {
    fn ordinal(&self) -> Option<usize> {
        match self {
            Stage::InlineRun { ordinal, .. } => Some(*ordinal),
            Stage::Header(op) | Stage::Probe(op) | Stage::Payload(op) => Some(op.ordinal),
            _ => None,
        }
    }
}

/// An in-progress send or receive of a [`Message`].
///
/// Dropping an unfinished transfer cancels it: the in-flight request is
/// cancelled, a pending allocation is freed, and the message is left
/// `Failed`. Allocations already recorded stay with the message until it is
/// released.
pub struct Transfer<'m, 'a, 's> {
    // Declared first so the request drops before the buffers it points into.
    request: Option<Box<dyn Request + 's>>,
    substrate: &'s dyn Substrate,
    pub(crate) message: &'m mut Message<'a>,
    direction: Direction,
    peer: Rank,
    channel: Channel,
    cursor: ManifestCursor,
    stage: Stage,
    control: Box<[u8; CONTROL_LEN]>,
    staging: Vec<u8>,
    pending: Option<RawAllocation>,
    preamble_done: bool,
}

impl<'m, 'a, 's> Transfer<'m, 'a, 's> {
    pub(crate) fn start(
        message: &'m mut Message<'a>,
        substrate: &'s dyn Substrate,
        direction: Direction,
        peer: Rank,
        channel: Channel,
    ) -> DeepResult<Self> {
        if message.state != MessageState::Open {
            return Err(DeepCopyError::InvalidState(message.state));
        }
        let roots = message
            .roots
            .iter()
            .map(|root| (Arc::new(root.layout.clone()), root.record.as_ptr()))
            .collect();
        message.state = MessageState::InFlight;
        log::debug!(
            "Transfer::start: {:?} {} roots / {} descriptors, peer {}, channel {}",
            direction,
            message.roots.len(),
            message.descriptor_count(),
            peer,
            channel
        );
        Ok(Self {
            request: None,
            substrate,
            message,
            direction,
            peer,
            channel,
            cursor: ManifestCursor::new(roots),
            stage: Stage::Ready,
            control: Box::new([0u8; CONTROL_LEN]),
            staging: Vec::new(),
            pending: None,
            preamble_done: false,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Descriptors reached so far in replay order.
    pub fn ordinal(&self) -> usize {
        self.cursor.ordinal()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, Stage::Finished)
    }

    /// Advance without blocking. Returns `Ok(true)` once every descriptor has
    /// been transferred.
    pub fn test(&mut self) -> DeepResult<bool> {
        self.drive(false)
    }

    /// Block until the transfer completes.
    pub fn wait(mut self) -> DeepResult<()> {
        self.drive(true).map(|_| ())
    }

    /// Abandon the transfer. The message keeps whatever it already allocated.
    pub fn cancel(mut self) {
        log::warn!(
            "Transfer::cancel: {:?} cancelled at descriptor #{}",
            self.direction,
            self.cursor.ordinal()
        );
        self.abort();
    }

    fn drive(&mut self, block: bool) -> DeepResult<bool> {
        match self.stage {
            Stage::Finished => return Ok(true),
            Stage::Failed => return Err(DeepCopyError::InvalidState(MessageState::Failed)),
            _ => {}
        }
        match self.drive_inner(block) {
            Ok(true) => {
                self.stage = Stage::Finished;
                self.message.state = MessageState::Completed;
                log::debug!(
                    "Transfer::finish: {:?} complete after {} descriptors, {} allocations held",
                    self.direction,
                    self.cursor.ordinal(),
                    self.message.tracker.len()
                );
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                log::warn!("Transfer::drive: {:?} aborted: {}", self.direction, err);
                self.abort();
                Err(err)
            }
        }
    }

    fn drive_inner(&mut self, block: bool) -> DeepResult<bool> {
        let backoff = Backoff::new();
        loop {
            if let Some(request) = self.request.as_mut() {
                let status = if block {
                    request.wait().map(|()| true)
                } else {
                    request.test()
                };
                match status {
                    Ok(true) => self.request = None,
                    Ok(false) => return Ok(false),
                    Err(source) => return Err(self.substrate_error(source)),
                }
                self.complete_stage()?;
                continue;
            }

            match std::mem::replace(&mut self.stage, Stage::Ready) {
                Stage::Ready => {
                    if !self.post_next()? {
                        return Ok(true);
                    }
                }
                Stage::Probe(op) => {
                    let probed = if block {
                        self.substrate.probe(self.peer, self.channel)
                    } else {
                        self.substrate.iprobe(self.peer, self.channel)
                    };
                    let status =
                        probed.map_err(|source| DeepCopyError::from_substrate(op.ordinal, source))?;
                    match status {
                        ProbeStatus::Ready(len) => self.probed(op, len)?,
                        ProbeStatus::Pending => {
                            self.stage = Stage::Probe(op);
                            if !block {
                                return Ok(false);
                            }
                            backoff.snooze();
                        }
                        ProbeStatus::Unsupported => {
                            return Err(DeepCopyError::Transport {
                                ordinal: op.ordinal,
                                source: SubstrateError::Unsupported("length probe"),
                            })
                        }
                    }
                }
                Stage::Finished => {
                    self.stage = Stage::Finished;
                    return Ok(true);
                }
                Stage::Failed => {
                    self.stage = Stage::Failed;
                    return Err(DeepCopyError::InvalidState(MessageState::Failed));
                }
                stage => {
                    // Every other stage owns a request; reaching here means it was lost.
                    let ordinal = stage.ordinal().unwrap_or(0);
                    return Err(DeepCopyError::Transport {
                        ordinal,
                        source: SubstrateError::other("transfer stage has no request in flight"),
                    });
                }
            }
        }
    }

    /// Post the next manifest step. Returns `false` when the manifest is exhausted.
    fn post_next(&mut self) -> DeepResult<bool> {
        if self.message.config.verify_manifest && !self.preamble_done {
            self.preamble_done = true;
            match self.direction {
                Direction::Send => {
                    let preamble = self.message.preamble().to_bytes();
                    self.control[..PREAMBLE_LEN].copy_from_slice(&preamble);
                    let buf = self.control.as_ptr();
                    self.post_transmit(buf, PREAMBLE_LEN, 0)?;
                }
                Direction::Receive => {
                    let buf = self.control.as_mut_ptr();
                    self.post_receive(buf, PREAMBLE_LEN, 0)?;
                }
            }
            self.stage = Stage::Preamble;
            return Ok(true);
        }

        let Some(op) = self.cursor.next_op() else {
            return Ok(false);
        };
        match op {
            Op::InlineRun {
                root,
                start,
                end,
                ordinal,
            } => {
                let record = self.message.roots[root].record.as_ptr();
                let fields = &self.message.roots[root].layout.fields()[start..end];
                let len: usize = fields.iter().filter_map(|d| d.byte_len()).sum();
                self.staging.clear();
                match self.direction {
                    Direction::Send => {
                        for field in fields {
                            let len = field.byte_len().unwrap_or(0);
                            // Safety: validated to lie inside the borrowed record.
                            let bytes = unsafe { raw_slice(record.add(field.offset), len) };
                            self.staging.extend_from_slice(bytes);
                        }
                        let buf = self.staging.as_ptr();
                        self.post_transmit(buf, len, ordinal)?;
                    }
                    Direction::Receive => {
                        self.staging.resize(len, 0);
                        let buf = self.staging.as_mut_ptr();
                        self.post_receive(buf, len, ordinal)?;
                    }
                }
                log::trace!(
                    "Transfer::post_next: inline run #{}..#{} of root {} ({} bytes)",
                    ordinal,
                    ordinal + (end - start),
                    root,
                    len
                );
                self.stage = Stage::InlineRun {
                    root,
                    start,
                    end,
                    ordinal,
                };
            }
            Op::Indirection(mut op) => match self.direction {
                Direction::Send => {
                    // Safety: the slot lies inside a live record or target element.
                    let target = unsafe { (op.slot as *const *mut u8).read_unaligned() };
                    op.target = target;
                    op.count = if target.is_null() {
                        0
                    } else {
                        unsafe { op.descriptor.live_count(op.record) }
                    };
                    let len = self.payload_len(&op)?;
                    match self.message.config.length_mode {
                        LengthMode::Prefix => {
                            let header = LengthHeader {
                                ordinal: op.ordinal as u64,
                                count: op.count as u64,
                                element_size: op.descriptor.element_size as u64,
                            };
                            self.control[..HEADER_LEN].copy_from_slice(&header.to_bytes());
                            let buf = self.control.as_ptr();
                            self.post_transmit(buf, HEADER_LEN, op.ordinal)?;
                            self.stage = Stage::Header(op);
                        }
                        LengthMode::Probe => {
                            self.post_transmit(op.target, len, op.ordinal)?;
                            self.stage = Stage::Payload(op);
                        }
                    }
                }
                Direction::Receive => match self.message.config.length_mode {
                    LengthMode::Prefix => {
                        let buf = self.control.as_mut_ptr();
                        self.post_receive(buf, HEADER_LEN, op.ordinal)?;
                        self.stage = Stage::Header(op);
                    }
                    LengthMode::Probe => self.stage = Stage::Probe(op),
                },
            },
        }
        Ok(true)
    }

    /// Handle the request that just completed for the current stage.
    fn complete_stage(&mut self) -> DeepResult<()> {
        match std::mem::replace(&mut self.stage, Stage::Ready) {
            Stage::Preamble => {
                if self.direction == Direction::Receive {
                    self.check_preamble()?;
                }
            }
            Stage::InlineRun {
                root, start, end, ..
            } => {
                if self.direction == Direction::Receive {
                    let record = self.message.roots[root].record.as_ptr();
                    let mut at = 0;
                    for field in &self.message.roots[root].layout.fields()[start..end] {
                        let len = field.byte_len().unwrap_or(0);
                        // Safety: validated to lie inside the borrowed record.
                        unsafe {
                            ptr::copy_nonoverlapping(
                                self.staging.as_ptr().add(at),
                                record.add(field.offset),
                                len,
                            );
                        }
                        at += len;
                    }
                }
            }
            Stage::Header(op) => match self.direction {
                Direction::Send if op.count == 0 => self.finish_indirection(op),
                Direction::Send => {
                    let len = self.payload_len(&op)?;
                    self.post_transmit(op.target, len, op.ordinal)?;
                    self.stage = Stage::Payload(op);
                }
                Direction::Receive => {
                    let mut bytes = [0u8; HEADER_LEN];
                    bytes.copy_from_slice(&self.control[..HEADER_LEN]);
                    let header = LengthHeader::from_bytes(&bytes);
                    if header.ordinal != op.ordinal as u64 {
                        return Err(DeepCopyError::mismatch(
                            op.ordinal,
                            format!("peer sent the header of descriptor #{}", header.ordinal),
                        ));
                    }
                    if header.element_size != op.descriptor.element_size as u64 {
                        return Err(DeepCopyError::mismatch(
                            op.ordinal,
                            format!(
                                "peer elements are {} bytes, manifest says {}",
                                header.element_size, op.descriptor.element_size
                            ),
                        ));
                    }
                    self.start_payload(op, header.count as usize)?;
                }
            },
            Stage::Payload(op) => self.finish_indirection(op),
            _ => {}
        }
        Ok(())
    }

    /// Probe mode: the next message on the route is the payload itself.
    fn probed(&mut self, op: IndirectionOp, len: usize) -> DeepResult<()> {
        let element_size = op.descriptor.element_size;
        if len % element_size != 0 {
            return Err(DeepCopyError::mismatch(
                op.ordinal,
                format!("payload of {len} bytes is not a multiple of {element_size}-byte elements"),
            ));
        }
        self.start_payload(op, len / element_size)
    }

    /// Receive side: allocate and post the payload receive for `count` elements.
    fn start_payload(&mut self, mut op: IndirectionOp, count: usize) -> DeepResult<()> {
        op.count = count;
        if count == 0 {
            if self.message.config.length_mode == LengthMode::Probe {
                // The empty payload is still on the route and must be consumed.
                self.post_receive(ptr::null_mut(), 0, op.ordinal)?;
                self.stage = Stage::Payload(op);
            } else {
                self.finish_indirection(op);
            }
            return Ok(());
        }

        let align = op.descriptor.element_align;
        let size = count.saturating_mul(op.descriptor.element_size);
        let failure = DeepCopyError::AllocationFailure {
            ordinal: op.ordinal,
            size,
            align,
        };
        if size > self.message.config.max_allocation {
            return Err(failure);
        }
        if let Some(available) = self.substrate.available() {
            if size > available {
                return Err(DeepCopyError::mismatch(
                    op.ordinal,
                    format!("{count} elements need {size} bytes, only {available} remain"),
                ));
            }
        }
        let allocation = self
            .message
            .tracker
            .allocate(size, align, op.ordinal)
            .ok_or(failure)?;
        let buf = allocation.as_ptr();
        self.pending = Some(allocation);
        self.post_receive(buf, size, op.ordinal)?;
        self.stage = Stage::Payload(op);
        Ok(())
    }

    /// Close out an indirection whose payload (if any) has been transferred.
    fn finish_indirection(&mut self, op: IndirectionOp) {
        match self.direction {
            Direction::Send => self.cursor.descend(&op, op.target, op.count),
            Direction::Receive => {
                let target = match self.pending.take() {
                    Some(allocation) => self.message.tracker.record(allocation),
                    None => ptr::null_mut(),
                };
                // Safety: the slot lies inside the borrowed record or a tracked element.
                unsafe { (op.slot as *mut *mut u8).write_unaligned(target) };
                if let Some((root, field)) = op.root_field {
                    let descriptor = &mut self.message.roots[root].layout.fields_mut()[field];
                    descriptor.count = op.count;
                    descriptor.owns_allocation = !target.is_null();
                }
                self.cursor.descend(&op, target, op.count);
            }
        }
        log::trace!(
            "Transfer::finish_indirection: {:?} descriptor #{} with {} elements",
            self.direction,
            op.ordinal,
            op.count
        );
    }

    fn check_preamble(&self) -> DeepResult<()> {
        let mut bytes = [0u8; PREAMBLE_LEN];
        bytes.copy_from_slice(&self.control[..PREAMBLE_LEN]);
        let theirs = ManifestPreamble::from_bytes(&bytes);
        let ours = self.message.preamble();
        let reason = if theirs.magic != ours.magic {
            format!("bad preamble magic {:#x}", theirs.magic)
        } else if theirs.roots != ours.roots {
            format!("peer has {} roots, manifest has {}", theirs.roots, ours.roots)
        } else if theirs.descriptors != ours.descriptors {
            format!(
                "peer has {} descriptors, manifest has {}",
                theirs.descriptors, ours.descriptors
            )
        } else if theirs.fingerprint != ours.fingerprint {
            format!(
                "layout fingerprint {:#018x} differs from {:#018x}",
                theirs.fingerprint, ours.fingerprint
            )
        } else {
            return Ok(());
        };
        Err(DeepCopyError::mismatch(0, reason))
    }

    fn payload_len(&self, op: &IndirectionOp) -> DeepResult<usize> {
        op.descriptor
            .element_size
            .checked_mul(op.count)
            .ok_or_else(|| {
                DeepCopyError::invalid(format!(
                    "descriptor #{} payload of {} x {} bytes overflows",
                    op.ordinal, op.count, op.descriptor.element_size
                ))
            })
    }

    fn post_transmit(&mut self, buf: *const u8, len: usize, ordinal: usize) -> DeepResult<()> {
        let substrate = self.substrate;
        // Safety: buf points into the control box, the staging vector or caller
        // memory borrowed by the message, none of which move or drop before the
        // request completes or is dropped.
        let request = unsafe { substrate.itransmit(buf, len, self.peer, self.channel) }
            .map_err(|source| DeepCopyError::from_substrate(ordinal, source))?;
        self.request = Some(request);
        Ok(())
    }

    fn post_receive(&mut self, buf: *mut u8, len: usize, ordinal: usize) -> DeepResult<()> {
        let substrate = self.substrate;
        // Safety: as for post_transmit; pending allocations live in `self.pending`.
        let request = unsafe { substrate.ireceive_into(buf, len, self.peer, self.channel) }
            .map_err(|source| DeepCopyError::from_substrate(ordinal, source))?;
        self.request = Some(request);
        Ok(())
    }

    fn substrate_error(&self, source: SubstrateError) -> DeepCopyError {
        DeepCopyError::from_substrate(self.stage.ordinal().unwrap_or(0), source)
    }

    fn abort(&mut self) {
        if let Some(mut request) = self.request.take() {
            request.cancel();
        }
        if let Some(allocation) = self.pending.take() {
            log::debug!(
                "Transfer::abort: freeing unfilled allocation for descriptor #{}",
                allocation.ordinal()
            );
        }
        self.stage = Stage::Failed;
        self.message.state = MessageState::Failed;
    }
}

impl Drop for Transfer<'_, '_, '_> {
    fn drop(&mut self) {
        if !matches!(self.stage, Stage::Finished | Stage::Failed) {
            log::warn!(
                "Transfer dropped before completion at descriptor #{}",
                self.cursor.ordinal()
            );
            self.abort();
        }
    }
}

impl std::fmt::Debug for Transfer<'_, '_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("direction", &self.direction)
            .field("peer", &self.peer)
            .field("channel", &self.channel)
            .field("ordinal", &self.cursor.ordinal())
            .field("in_flight", &self.request.is_some())
            .finish_non_exhaustive()
    }
}
