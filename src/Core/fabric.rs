// In-process messaging fabric
// Every rank gets an Endpoint; each (source, destination, channel) route is a FIFO mailbox.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::substrate::{check_len, raw_slice_mut, Channel, ProbeStatus, Rank, Request, Substrate};
use crate::error::{SubstrateError, SubstrateResult};

pub struct FabricBuilder {
    ranks: u32,
    receive_timeout: Option<Duration>,
}

impl Default for FabricBuilder {
    fn default() -> Self {
        Self {
            ranks: 2,
            receive_timeout: None, // block forever
        }
    }
}

impl FabricBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ranks(mut self, ranks: u32) -> Self {
        self.ranks = ranks;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> LocalFabric {
        LocalFabric {
            inner: Arc::new(FabricInner {
                ranks: self.ranks,
                receive_timeout: self.receive_timeout,
                mailboxes: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
                messages: CachePadded::new(AtomicU64::new(0)),
                bytes: CachePadded::new(AtomicU64::new(0)),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Route {
    pub source: Rank,
    pub destination: Rank,
    pub channel: Channel,
}

pub(crate) struct FabricInner {
    pub(crate) ranks: u32,
    pub(crate) receive_timeout: Option<Duration>,
    mailboxes: Mutex<HashMap<Route, VecDeque<Box<[u8]>>>>,
    arrived: Condvar,
    /// Messages accepted since creation.
    pub(crate) messages: CachePadded<AtomicU64>,
    /// Payload bytes accepted since creation.
    pub(crate) bytes: CachePadded<AtomicU64>,
}

/// Shared in-process fabric connecting `ranks` endpoints.
///
/// Sends are eager: the payload is copied into the destination mailbox and the
/// send completes immediately. Receives block until a message is queued on
/// the route (or the configured timeout elapses).
#[derive(Clone)]
pub struct LocalFabric {
    pub(crate) inner: Arc<FabricInner>,
}

impl LocalFabric {
    pub fn new(ranks: u32) -> Self {
        FabricBuilder::new().with_ranks(ranks).build()
    }

    pub fn builder() -> FabricBuilder {
        FabricBuilder::new()
    }

    /// Attach to the fabric as `rank`.
    pub fn endpoint(&self, rank: Rank) -> SubstrateResult<Endpoint> {
        if rank >= self.inner.ranks {
            return Err(SubstrateError::UnknownPeer(rank));
        }
        Ok(Endpoint {
            rank,
            fabric: Arc::clone(&self.inner),
        })
    }

    pub fn ranks(&self) -> u32 {
        self.inner.ranks
    }

    /// Messages queued but not yet received, across all routes.
    pub fn pending_messages(&self) -> usize {
        self.inner.mailboxes.lock().values().map(VecDeque::len).sum()
    }

    pub fn messages_sent(&self) -> u64 {
        self.inner.messages.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes.load(Ordering::Relaxed)
    }
}

/// One rank's view of a [`LocalFabric`].
pub struct Endpoint {
    pub(crate) rank: Rank,
    pub(crate) fabric: Arc<FabricInner>,
}

impl Endpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn route_from(&self, peer: Rank, channel: Channel) -> SubstrateResult<Route> {
        if peer >= self.fabric.ranks {
            return Err(SubstrateError::UnknownPeer(peer));
        }
        Ok(Route {
            source: peer,
            destination: self.rank,
            channel,
        })
    }

    /// Pop the next message on `route` into `buf` if one is queued.
    fn try_take(
        mailboxes: &mut MutexGuard<'_, HashMap<Route, VecDeque<Box<[u8]>>>>,
        route: Route,
        buf: &mut [u8],
    ) -> Option<SubstrateResult<()>> {
        let queue = mailboxes.get_mut(&route)?;
        let message = queue.pop_front()?;
        if queue.is_empty() {
            mailboxes.remove(&route);
        }
        // A length disagreement still consumes the message.
        Some(check_len(route.channel, buf.len(), message.len()).map(|()| {
            buf.copy_from_slice(&message);
        }))
    }

    fn peek_len(
        mailboxes: &MutexGuard<'_, HashMap<Route, VecDeque<Box<[u8]>>>>,
        route: Route,
    ) -> Option<usize> {
        mailboxes
            .get(&route)
            .and_then(|queue| queue.front())
            .map(|message| message.len())
    }

    /// Block on the fabric condition variable; honours the receive timeout.
    fn block(
        &self,
        mailboxes: &mut MutexGuard<'_, HashMap<Route, VecDeque<Box<[u8]>>>>,
        started: Instant,
    ) -> SubstrateResult<()> {
        match self.fabric.receive_timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero()
                    || self.fabric.arrived.wait_for(mailboxes, remaining).timed_out()
                {
                    return Err(SubstrateError::Timeout(timeout));
                }
                Ok(())
            }
            None => {
                self.fabric.arrived.wait(mailboxes);
                Ok(())
            }
        }
    }

    fn receive_blocking(&self, route: Route, buf: &mut [u8]) -> SubstrateResult<()> {
        let started = Instant::now();
        let mut mailboxes = self.fabric.mailboxes.lock();
        loop {
            if let Some(result) = Self::try_take(&mut mailboxes, route, buf) {
                return result;
            }
            self.block(&mut mailboxes, started)?;
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_endpoint(self, f)
    }
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_local_fabric(self, f)
    }
}

impl Substrate for Endpoint {
    fn transmit(&self, buf: &[u8], peer: Rank, channel: Channel) -> SubstrateResult<()> {
        if peer >= self.fabric.ranks {
            return Err(SubstrateError::UnknownPeer(peer));
        }
        let route = Route {
            source: self.rank,
            destination: peer,
            channel,
        };
        {
            let mut mailboxes = self.fabric.mailboxes.lock();
            mailboxes
                .entry(route)
                .or_default()
                .push_back(Box::from(buf));
        }
        self.fabric.messages.fetch_add(1, Ordering::Relaxed);
        self.fabric.bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.fabric.arrived.notify_all();
        Ok(())
    }

    fn receive_into(&self, buf: &mut [u8], peer: Rank, channel: Channel) -> SubstrateResult<()> {
        let route = self.route_from(peer, channel)?;
        self.receive_blocking(route, buf)
    }

    fn probe(&self, peer: Rank, channel: Channel) -> SubstrateResult<ProbeStatus> {
        let route = self.route_from(peer, channel)?;
        let started = Instant::now();
        let mut mailboxes = self.fabric.mailboxes.lock();
        loop {
            if let Some(len) = Self::peek_len(&mailboxes, route) {
                return Ok(ProbeStatus::Ready(len));
            }
            self.block(&mut mailboxes, started)?;
        }
    }

    fn iprobe(&self, peer: Rank, channel: Channel) -> SubstrateResult<ProbeStatus> {
        let route = self.route_from(peer, channel)?;
        let mailboxes = self.fabric.mailboxes.lock();
        Ok(Self::peek_len(&mailboxes, route)
            .map(ProbeStatus::Ready)
            .unwrap_or(ProbeStatus::Pending))
    }

    unsafe fn ireceive_into<'s>(
        &'s self,
        buf: *mut u8,
        len: usize,
        peer: Rank,
        channel: Channel,
    ) -> SubstrateResult<Box<dyn Request + 's>> {
        let route = self.route_from(peer, channel)?;
        Ok(Box::new(PendingReceive {
            endpoint: self,
            route,
            buf,
            len,
            state: ReceiveState::Posted,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Posted,
    Complete,
    Cancelled,
}

/// Outstanding receive on a fabric route. Matching happens on `test`/`wait`.
struct PendingReceive<'s> {
    endpoint: &'s Endpoint,
    route: Route,
    buf: *mut u8,
    len: usize,
    state: ReceiveState,
}

impl PendingReceive<'_> {
    fn buffer(&mut self) -> &mut [u8] {
        // Safety: the poster guarantees the buffer outlives this request.
        unsafe { raw_slice_mut(self.buf, self.len) }
    }

    fn finish(&mut self, result: SubstrateResult<()>) -> SubstrateResult<()> {
        // Failed matches also retire the request; a second wait must not re-match.
        self.state = ReceiveState::Complete;
        result
    }
}

impl Request for PendingReceive<'_> {
    fn test(&mut self) -> SubstrateResult<bool> {
        match self.state {
            ReceiveState::Complete => return Ok(true),
            ReceiveState::Cancelled => return Err(SubstrateError::Cancelled),
            ReceiveState::Posted => {}
        }
        let route = self.route;
        let endpoint = self.endpoint;
        let mut mailboxes = endpoint.fabric.mailboxes.lock();
        match Endpoint::try_take(&mut mailboxes, route, self.buffer()) {
            Some(result) => {
                drop(mailboxes);
                self.finish(result).map(|()| true)
            }
            None => Ok(false),
        }
    }

    fn wait(&mut self) -> SubstrateResult<()> {
        match self.state {
            ReceiveState::Complete => return Ok(()),
            ReceiveState::Cancelled => return Err(SubstrateError::Cancelled),
            ReceiveState::Posted => {}
        }
        let route = self.route;
        let endpoint = self.endpoint;
        let result = endpoint.receive_blocking(route, self.buffer());
        self.finish(result)
    }

    fn cancel(&mut self) {
        if self.state == ReceiveState::Posted {
            self.state = ReceiveState::Cancelled;
        }
    }
}
