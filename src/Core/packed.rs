// Contiguous-buffer substrates used by buffered deep copies.
// PackWriter appends every transfer to one buffer, PackReader replays them in order
// and SizeCounter only measures how large the packed buffer will be.

use parking_lot::Mutex;

use super::substrate::{Channel, Rank, Substrate};
use crate::error::{SubstrateError, SubstrateResult};

/// Write-only substrate appending each transfer to a single byte buffer.
///
/// Peer and channel are ignored: the buffer itself is the destination.
#[derive(Debug, Default)]
pub struct PackWriter {
    buffer: Mutex<Vec<u8>>,
    capacity: Option<usize>,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the packed size; transfers past `capacity` fail with `Overrun`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer.into_inner()
    }
}

impl Substrate for PackWriter {
    fn transmit(&self, buf: &[u8], _peer: Rank, _channel: Channel) -> SubstrateResult<()> {
        let mut buffer = self.buffer.lock();
        if let Some(capacity) = self.capacity {
            if buffer.len() + buf.len() > capacity {
                return Err(SubstrateError::Overrun {
                    offset: buffer.len(),
                    needed: buf.len(),
                    capacity,
                });
            }
        }
        buffer.extend_from_slice(buf);
        Ok(())
    }

    fn receive_into(&self, _buf: &mut [u8], _peer: Rank, _channel: Channel) -> SubstrateResult<()> {
        Err(SubstrateError::Unsupported("receive on a pack writer"))
    }
}

/// Read-only substrate handing out consecutive slices of a packed buffer.
#[derive(Debug)]
pub struct PackReader {
    buffer: Vec<u8>,
    offset: Mutex<usize>,
}

impl PackReader {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            offset: Mutex::new(0),
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - *self.offset.lock()
    }
}

impl Substrate for PackReader {
    fn transmit(&self, _buf: &[u8], _peer: Rank, _channel: Channel) -> SubstrateResult<()> {
        Err(SubstrateError::Unsupported("transmit on a pack reader"))
    }

    fn available(&self) -> Option<usize> {
        Some(self.remaining())
    }

    fn receive_into(&self, buf: &mut [u8], _peer: Rank, _channel: Channel) -> SubstrateResult<()> {
        let mut offset = self.offset.lock();
        let end = *offset + buf.len();
        if end > self.buffer.len() {
            return Err(SubstrateError::Overrun {
                offset: *offset,
                needed: buf.len(),
                capacity: self.buffer.len(),
            });
        }
        buf.copy_from_slice(&self.buffer[*offset..end]);
        *offset = end;
        Ok(())
    }
}

/// Substrate that discards payloads and counts their bytes.
#[derive(Debug, Default)]
pub struct SizeCounter {
    bytes: Mutex<usize>,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> usize {
        *self.bytes.lock()
    }
}

impl Substrate for SizeCounter {
    fn transmit(&self, buf: &[u8], _peer: Rank, _channel: Channel) -> SubstrateResult<()> {
        *self.bytes.lock() += buf.len();
        Ok(())
    }

    fn receive_into(&self, _buf: &mut [u8], _peer: Rank, _channel: Channel) -> SubstrateResult<()> {
        Err(SubstrateError::Unsupported("receive on a size counter"))
    }
}
