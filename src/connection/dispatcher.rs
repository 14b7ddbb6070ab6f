//! Send and receive paths shared by clients and servers.
//!
//! Outbound requests take the token's send lock, get a correlation id, are
//! encoded and written as one frame, then wait for their completion outside
//! the lock. The receive loop reads one frame at a time and decides whether it
//! settles one of our requests or is a request for the local handler.

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::token::{Outcome, Reply, Token};
use crate::codec::Codec;
use crate::error::NetError;
use crate::frame::{self, FrameHeader, FrameKind, UNIDENTIFIED};
use crate::handler::MessageHandler;
use crate::pool::{BufferPool, PooledBuffer};
use crate::{mux_debug, mux_info, mux_warn};

pub struct Dispatcher<C: Codec> {
    codec: Arc<C>,
    handler: Arc<dyn MessageHandler<C::Message>>,
    pool: Arc<BufferPool>,
    reply_timeout: Duration,
}

impl<C: Codec> Dispatcher<C> {
    /// `reply_timeout` bounds how long a response waits for the send lock.
    pub fn new(
        codec: Arc<C>,
        handler: Arc<dyn MessageHandler<C::Message>>,
        pool: Arc<BufferPool>,
        reply_timeout: Duration,
    ) -> Self {
        Self { codec, handler, pool, reply_timeout }
    }

    #[inline] pub fn codec(&self) -> &C               { &self.codec }
    #[inline] pub fn pool(&self) -> &Arc<BufferPool>  { &self.pool }

    /* ----------------------------------------------------------------
       Send path
    ---------------------------------------------------------------- */

    pub async fn send(
        &self,
        token: &Token<C::Message>,
        message: C::Message,
        timeout: Duration,
    ) -> Result<C::Message, NetError> {
        self.send_with_cancel(token, message, timeout, None).await
    }

    /// Sends a request and waits for its reply, the deadline, or `cancel`.
    pub async fn send_with_cancel(
        &self,
        token: &Token<C::Message>,
        message: C::Message,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<C::Message, NetError> {
        let deadline = Instant::now() + timeout;
        let outcome = if self.codec.is_identified(&message) {
            self.send_tagged(token, message, deadline, cancel).await
        } else {
            self.send_untagged(token, message, deadline, cancel).await
        };

        match outcome? {
            Reply::Message(reply) => Ok(reply),
            Reply::Pong => Err(NetError::UnexpectedReply),
        }
    }

    /// Like [`send`](Self::send), converting the reply into `R`.
    pub async fn call<R>(
        &self,
        token: &Token<C::Message>,
        message: C::Message,
        timeout: Duration,
    ) -> Result<R, NetError>
    where
        R: TryFrom<C::Message>,
    {
        let reply = self.send(token, message, timeout).await?;
        R::try_from(reply).map_err(|_| NetError::UnexpectedReply)
    }

    async fn send_tagged(
        &self,
        token: &Token<C::Message>,
        message: C::Message,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Outcome<C::Message> {
        let (id, rx) = {
            let mut guard = token.lock_send(deadline).await?;
            let id = token.next_request_id();
            let rx = token.register_pending(id)?;

            let frame = match self.encode_frame(token, id, FrameKind::Message, message) {
                Ok(frame) => frame,
                Err(e) => {
                    token.cancel_pending(id);
                    return Err(e);
                }
            };
            let written = guard.write(&frame).await;
            self.pool.release(frame);
            if let Err(e) = written {
                token.cancel_pending(id);
                return Err(e);
            }
            (id, rx)
        };

        token.await_reply(id, rx, deadline, cancel).await
    }

    async fn send_untagged(
        &self,
        token: &Token<C::Message>,
        message: C::Message,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Outcome<C::Message> {
        // held until the reply settles; the slot has room for one waiter
        let gate = token.lock_unidentified(deadline).await?;

        let rx = {
            let mut guard = token.lock_send(deadline).await?;
            let rx = token.register_unidentified()?;

            let frame = match self.encode_frame(token, UNIDENTIFIED, FrameKind::Message, message) {
                Ok(frame) => frame,
                Err(e) => {
                    token.cancel_unidentified();
                    return Err(e);
                }
            };
            let written = guard.write(&frame).await;
            self.pool.release(frame);
            if let Err(e) = written {
                token.cancel_unidentified();
                return Err(e);
            }
            rx
        };

        token.await_unidentified(rx, gate, deadline, cancel).await
    }

    /// Fire-and-forget: the peer's handler runs, its response is discarded.
    pub async fn post(
        &self,
        token: &Token<C::Message>,
        message: C::Message,
        timeout: Duration,
    ) -> Result<(), NetError> {
        let mut guard = token.lock_send(Instant::now() + timeout).await?;
        let frame = self.encode_frame(token, UNIDENTIFIED, FrameKind::OneWay, message)?;
        let written = guard.write(&frame).await;
        self.pool.release(frame);
        written
    }

    /// Encodes a body once so it can be posted to many tokens.
    pub fn encode_body(&self, message: C::Message) -> Result<Bytes, NetError> {
        let mut body = BytesMut::new();
        self.codec.encode(message, &mut body)?;
        Ok(body.freeze())
    }

    /// Posts a body produced by [`encode_body`](Self::encode_body).
    pub async fn post_encoded(
        &self,
        token: &Token<C::Message>,
        body: &Bytes,
        timeout: Duration,
    ) -> Result<(), NetError> {
        let mut guard = token.lock_send(Instant::now() + timeout).await?;
        let mut frame = self.pool.acquire();
        FrameHeader::new(UNIDENTIFIED, FrameKind::OneWay, body.len()).encode_into(&mut frame);
        frame.extend_from_slice(body);
        let written = guard.write(&frame).await;
        self.pool.release(frame);
        written
    }

    fn encode_frame(
        &self,
        token: &Token<C::Message>,
        id: i32,
        kind: FrameKind,
        message: C::Message,
    ) -> Result<PooledBuffer, NetError> {
        let mut frame = self.pool.acquire();
        frame::begin(&mut frame, id, kind);
        if let Err(e) = self.codec.encode(message, &mut frame) {
            self.pool.release(frame);
            return Err(e.into());
        }

        let max = token.transport().options().max_frame_size;
        if frame.len() > max {
            let len = frame.len();
            self.pool.release(frame);
            return Err(NetError::Encode(format!("frame of {len} B exceeds the {max} B limit")));
        }
        frame::patch_len(&mut frame);
        Ok(frame)
    }

    /* ----------------------------------------------------------------
       Receive path
    ---------------------------------------------------------------- */

    /// Runs the receive loop until the connection drops, then tears the token down.
    pub async fn serve(self: Arc<Self>, token: Arc<Token<C::Message>>) {
        let transport = token.transport();
        mux_debug!("Receive loop started for {} ({})", token.id(), token.remote_addr());

        loop {
            let mut buf = self.pool.acquire();
            let header = match transport.receive(&mut buf).await {
                Ok(header) => header,
                Err(e) => {
                    self.pool.release(buf);
                    mux_debug!("Receive loop for {} stopping: {}", token.id(), e);
                    break;
                }
            };

            token.touch();

            // a handler still running when the connection drops is abandoned
            let dropped = tokio::select! {
                _ = self.dispatch(&token, header, &buf) => false,
                _ = transport.disconnected() => true,
            };
            self.pool.release(buf);
            if dropped {
                mux_debug!("Receive loop for {} stopping mid-request", token.id());
                break;
            }
        }

        token.clear();
        transport.close().await;
        mux_info!("Connection {} ({}) closed", token.id(), token.remote_addr());
    }

    async fn dispatch(&self, token: &Token<C::Message>, header: FrameHeader, body: &[u8]) {
        let id = header.id;
        match header.kind {
            FrameKind::Ping => self.reply_control(token, id, FrameKind::Pong, "").await,
            FrameKind::Pong => self.settle(token, id, Ok(Reply::Pong)),
            FrameKind::NotSupported => self.settle(token, id, Err(NetError::NotSupported)),
            FrameKind::HandlerError => {
                let reason = String::from_utf8_lossy(body).into_owned();
                self.settle(token, id, Err(NetError::Handler(reason)))
            }
            FrameKind::Message if Self::is_reply(token, id) => {
                let outcome = match self.codec.decode(body) {
                    Ok(Some(reply)) => Ok(Reply::Message(reply)),
                    Ok(None) => Err(NetError::NotSupported),
                    Err(e) => Err(NetError::Decode(e.0)),
                };
                self.settle(token, id, outcome)
            }
            FrameKind::Message | FrameKind::OneWay => self.handle_request(token, header, body).await,
        }
    }

    fn is_reply(token: &Token<C::Message>, id: i32) -> bool {
        if id == UNIDENTIFIED {
            token.has_unidentified()
        } else {
            token.is_local_id(id)
        }
    }

    fn settle(&self, token: &Token<C::Message>, id: i32, outcome: Outcome<C::Message>) {
        let settled = if id == UNIDENTIFIED {
            token.resolve_unidentified(outcome)
        } else {
            token.resolve(id, outcome)
        };
        if !settled {
            mux_debug!("Dropping late reply {} from {}", id, token.remote_addr());
        }
    }

    async fn handle_request(&self, token: &Token<C::Message>, header: FrameHeader, body: &[u8]) {
        let id = header.id;
        let remote = token.remote_addr();
        let wants_reply = header.kind == FrameKind::Message;

        let message = match self.codec.decode(body) {
            Ok(Some(message)) => message,
            Ok(None) => {
                mux_debug!("Unrecognized message {} from {}", id, remote);
                if wants_reply {
                    self.reply_control(token, id, FrameKind::NotSupported, "").await;
                }
                return;
            }
            Err(e) => {
                mux_warn!("Failed to decode message {} from {}: {}", id, remote, e);
                if wants_reply {
                    self.reply_control(token, id, FrameKind::NotSupported, &e.to_string()).await;
                }
                return;
            }
        };

        let handled = AssertUnwindSafe(self.handler.handle(remote, message))
            .catch_unwind()
            .await;

        let failure = match handled {
            Ok(Ok(Some(response))) => {
                if wants_reply {
                    self.reply(token, id, response).await;
                }
                return;
            }
            Ok(Ok(None)) => {
                if wants_reply {
                    self.reply_control(token, id, FrameKind::NotSupported, "").await;
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        mux_warn!("Handler failed on message {} from {}: {}", id, remote, failure);
        if wants_reply {
            self.reply_control(token, id, FrameKind::HandlerError, &failure).await;
        }
    }

    async fn reply(&self, token: &Token<C::Message>, id: i32, response: C::Message) {
        match self.encode_frame(token, id, FrameKind::Message, response) {
            Ok(frame) => {
                self.write_reply(token, id, &frame).await;
                self.pool.release(frame);
            }
            Err(e) => {
                mux_warn!("Failed to encode response {} for {}: {}", id, token.remote_addr(), e);
                self.reply_control(token, id, FrameKind::NotSupported, &e.to_string()).await;
            }
        }
    }

    async fn reply_control(&self, token: &Token<C::Message>, id: i32, kind: FrameKind, text: &str) {
        let mut frame = self.pool.acquire();
        frame::control(&mut frame, id, kind, text);
        self.write_reply(token, id, &frame).await;
        self.pool.release(frame);
    }

    async fn write_reply(&self, token: &Token<C::Message>, id: i32, frame: &[u8]) {
        let written = match token.lock_send(Instant::now() + self.reply_timeout).await {
            Ok(mut guard) => guard.write(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            mux_debug!("Reply {} to {} not sent: {}", id, token.remote_addr(), e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
