//! Per-connection state: id generation, in-flight requests and the send lock.

use bytes::BytesMut;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedMutexGuard};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::transport::Transport;
use crate::error::NetError;
use crate::frame::{self, FrameKind, HEADER_LEN, UNIDENTIFIED};
use crate::{mux_debug, mux_trace, mux_warn};

/// Which side of the connection a token lives on.
///
/// Clients number their requests 1, 3, 5, ... and servers 2, 4, 6, ..., so a
/// frame's id alone tells whether it answers one of our requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

impl Origin {
    fn seed(self) -> i32 {
        match self {
            Origin::Client => -1,
            Origin::Server => 0,
        }
    }

    pub fn owns(self, id: i32) -> bool {
        match self {
            Origin::Client => id & 1 == 1,
            Origin::Server => id != UNIDENTIFIED && id & 1 == 0,
        }
    }
}

/// What a pending request resolves with.
#[derive(Debug)]
pub enum Reply<M> {
    Message(M),
    Pong,
}

pub type Outcome<M> = Result<Reply<M>, NetError>;

struct PendingRequest<M> {
    completion: oneshot::Sender<Outcome<M>>,
    registered: Instant,
}

/// The single reply slot for untagged requests.
enum Untagged<M> {
    Empty,
    Waiting(oneshot::Sender<Outcome<M>>),
    /// The caller gave up but the peer still owes a reply. The gate stays
    /// closed until that reply arrives and is dropped.
    Abandoned(OwnedMutexGuard<()>),
}

pub struct Token<M> {
    id: Uuid,
    origin: Origin,
    transport: Transport,
    next_request_id: AtomicI32,
    pending: DashMap<i32, PendingRequest<M>>,
    max_pending: usize,
    unidentified: Mutex<Untagged<M>>,
    unidentified_gate: Arc<AsyncMutex<()>>,
    send_lock: AsyncMutex<()>,
    cleared: AtomicBool,
    idle_ticks: AtomicU32,
    ping_outstanding: AtomicBool,
}

impl<M: Send + 'static> Token<M> {
    pub fn new(transport: Transport, origin: Origin, max_pending: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            transport,
            next_request_id: AtomicI32::new(origin.seed()),
            pending: DashMap::new(),
            max_pending,
            unidentified: Mutex::new(Untagged::Empty),
            unidentified_gate: Arc::new(AsyncMutex::new(())),
            send_lock: AsyncMutex::new(()),
            cleared: AtomicBool::new(false),
            idle_ticks: AtomicU32::new(0),
            ping_outstanding: AtomicBool::new(false),
        }
    }

    #[inline] pub fn id(&self) -> Uuid                { self.id }
    #[inline] pub fn origin(&self) -> Origin          { self.origin }
    #[inline] pub fn transport(&self) -> &Transport   { &self.transport }
    #[inline] pub fn remote_addr(&self) -> SocketAddr { self.transport.remote_addr() }
    #[inline] pub fn pending_count(&self) -> usize    { self.pending.len() }

    pub fn is_connected(&self) -> bool {
        !self.transport.is_disconnected() && !self.cleared.load(Ordering::SeqCst)
    }

    /// Fires the transport's disconnect signal; the receive loop tears down.
    pub fn disconnect(&self) -> bool {
        self.transport.disconnect()
    }

    /* ----------------------------------------------------------------
       Correlation
    ---------------------------------------------------------------- */

    pub fn next_request_id(&self) -> i32 {
        loop {
            let id = self.next_request_id.fetch_add(2, Ordering::Relaxed).wrapping_add(2);
            if id != UNIDENTIFIED {
                return id;
            }
        }
    }

    /// True when `id` was allocated on this side, i.e. a frame carrying it is a reply.
    pub fn is_local_id(&self, id: i32) -> bool {
        self.origin.owns(id)
    }

    /// # Panics
    /// If `id` is already outstanding on this token.
    pub fn register_pending(&self, id: i32) -> Result<oneshot::Receiver<Outcome<M>>, NetError> {
        let outstanding = self.pending.len();
        if outstanding >= self.max_pending {
            mux_warn!(
                "Token {} has {} outstanding requests; refusing request {}",
                self.id, outstanding, id
            );
            return Err(NetError::PendingLimit(self.max_pending));
        }

        let (tx, rx) = oneshot::channel();
        let previous = self.pending.insert(id, PendingRequest { completion: tx, registered: Instant::now() });
        assert!(previous.is_none(), "request id {id} registered twice on token {}", self.id);

        // clear() may have drained the map between the checks above and the insert
        if self.cleared.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(NetError::Disconnected);
        }
        Ok(rx)
    }

    /// Completes the request `id`. `false` means nothing was waiting for it.
    pub fn resolve(&self, id: i32, outcome: Outcome<M>) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                mux_trace!("Request {} on {} settled after {:?}", id, self.id, request.registered.elapsed());
                let _ = request.completion.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drops the registration without completing it.
    pub fn cancel_pending(&self, id: i32) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Serializes untagged requests: the reply slot holds only one waiter.
    pub async fn lock_unidentified(&self, deadline: Instant) -> Result<OwnedMutexGuard<()>, NetError> {
        timeout_at(deadline, self.unidentified_gate.clone().lock_owned())
            .await
            .map_err(|_| NetError::Timeout)
    }

    pub fn register_unidentified(&self) -> Result<oneshot::Receiver<Outcome<M>>, NetError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.slot();
            assert!(
                matches!(*slot, Untagged::Empty),
                "untagged request already outstanding on token {}",
                self.id
            );
            *slot = Untagged::Waiting(tx);
        }
        if self.cleared.load(Ordering::SeqCst) {
            *self.slot() = Untagged::Empty;
            return Err(NetError::Disconnected);
        }
        Ok(rx)
    }

    /// True while an untagged reply is expected, including one nobody waits for anymore.
    pub fn has_unidentified(&self) -> bool {
        !matches!(*self.slot(), Untagged::Empty)
    }

    /// Completes the untagged waiter. `false` means nobody was waiting; an
    /// owed reply to an abandoned request is swallowed and reopens the gate.
    pub fn resolve_unidentified(&self, outcome: Outcome<M>) -> bool {
        let taken = std::mem::replace(&mut *self.slot(), Untagged::Empty);
        match taken {
            Untagged::Waiting(completion) => {
                let _ = completion.send(outcome);
                true
            }
            Untagged::Abandoned(_gate) => {
                mux_debug!("Late untagged reply on {} dropped", self.id);
                false
            }
            Untagged::Empty => false,
        }
    }

    /// Drops a registration whose frame never reached the peer.
    pub fn cancel_unidentified(&self) -> bool {
        let mut slot = self.slot();
        match *slot {
            Untagged::Waiting(_) => {
                *slot = Untagged::Empty;
                true
            }
            _ => false,
        }
    }

    /// Gives up on a sent untagged request, parking `gate` until its reply shows up.
    fn abandon_unidentified(&self, gate: OwnedMutexGuard<()>) -> bool {
        let mut slot = self.slot();
        match *slot {
            Untagged::Waiting(_) => {
                *slot = Untagged::Abandoned(gate);
                true
            }
            _ => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Untagged<M>> {
        self.unidentified.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn wait(
        rx: &mut oneshot::Receiver<Outcome<M>>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<Outcome<M>, NetError> {
        let canceled = async {
            match cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            outcome = rx => Ok(outcome.unwrap_or(Err(NetError::Disconnected))),
            _ = sleep_until(deadline) => Err(NetError::Timeout),
            _ = canceled => Err(NetError::Canceled),
        }
    }

    /// Waits for the completion of a registered request.
    ///
    /// On timeout or cancellation the registration is withdrawn; if a reply
    /// won the race it is returned instead.
    pub async fn await_reply(
        &self,
        id: i32,
        mut rx: oneshot::Receiver<Outcome<M>>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Outcome<M> {
        let reason = match Self::wait(&mut rx, deadline, cancel).await {
            Ok(outcome) => return outcome,
            Err(reason) => reason,
        };

        if self.cancel_pending(id) {
            mux_debug!("Request {} on {} abandoned: {}", id, self.id, reason);
            return Err(reason);
        }
        rx.try_recv().unwrap_or(Err(reason))
    }

    /// Like [`await_reply`](Self::await_reply) for the untagged slot.
    ///
    /// `gate` is released with the reply. If the caller gives up first, the
    /// gate stays closed until the peer's late reply has been dropped, so it
    /// can never complete the next untagged request.
    pub async fn await_unidentified(
        &self,
        mut rx: oneshot::Receiver<Outcome<M>>,
        gate: OwnedMutexGuard<()>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Outcome<M> {
        let reason = match Self::wait(&mut rx, deadline, cancel).await {
            Ok(outcome) => return outcome,
            Err(reason) => reason,
        };

        if self.abandon_unidentified(gate) {
            mux_debug!("Untagged request on {} abandoned: {}", self.id, reason);
            return Err(reason);
        }
        rx.try_recv().unwrap_or(Err(reason))
    }

    /// Resolves everything still outstanding with [`NetError::Disconnected`].
    ///
    /// Only the first call does anything.
    pub fn clear(&self) -> bool {
        if self.cleared.swap(true, Ordering::SeqCst) {
            return false;
        }

        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for id in ids {
            if self.resolve(id, Err(NetError::Disconnected)) {
                failed += 1;
            }
        }
        if self.resolve_unidentified(Err(NetError::Disconnected)) {
            failed += 1;
        }

        if failed > 0 {
            mux_debug!("Token {} cleared, {} outstanding requests failed", self.id, failed);
        }
        true
    }

    /* ----------------------------------------------------------------
       Sending
    ---------------------------------------------------------------- */

    /// Takes the send lock, giving up at `deadline` without touching the wire.
    pub async fn lock_send(&self, deadline: Instant) -> Result<SendGuard<'_, M>, NetError> {
        if !self.is_connected() {
            return Err(NetError::Disconnected);
        }
        let lock = timeout_at(deadline, self.send_lock.lock())
            .await
            .map_err(|_| NetError::Timeout)?;
        if !self.is_connected() {
            return Err(NetError::Disconnected);
        }
        Ok(SendGuard { token: self, _lock: lock })
    }

    /// Round trip of a liveness probe.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, NetError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let (id, rx) = {
            let mut guard = self.lock_send(deadline).await?;
            let id = self.next_request_id();
            let rx = self.register_pending(id)?;

            let mut probe = BytesMut::with_capacity(HEADER_LEN);
            frame::control(&mut probe, id, FrameKind::Ping, "");
            if let Err(e) = guard.write(&probe).await {
                self.cancel_pending(id);
                return Err(e);
            }
            (id, rx)
        };

        match self.await_reply(id, rx, deadline, None).await? {
            Reply::Pong => Ok(started.elapsed()),
            Reply::Message(_) => Err(NetError::UnexpectedReply),
        }
    }

    /* ----------------------------------------------------------------
       Idle bookkeeping for the ping operator
    ---------------------------------------------------------------- */

    pub fn touch(&self) {
        self.idle_ticks.store(0, Ordering::Relaxed);
    }

    pub fn tick_idle(&self) -> u32 {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn begin_ping(&self) -> bool {
        self.ping_outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_ping(&self) {
        self.ping_outstanding.store(false, Ordering::Release);
    }
}

/// Exclusive right to write frames on a token.
pub struct SendGuard<'a, M> {
    token: &'a Token<M>,
    _lock: AsyncMutexGuard<'a, ()>,
}

impl<M> SendGuard<'_, M> {
    pub async fn write(&mut self, frame: &[u8]) -> Result<(), NetError> {
        self.token
            .transport
            .write(frame)
            .await
            .map_err(|_| NetError::Disconnected)
    }
}
