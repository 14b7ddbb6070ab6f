use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::connection::{Dispatcher, Origin, Token, Transport};
use crate::error::NetError;
use crate::event::ClientEvent;
use crate::handler::MessageHandler;
use crate::ping::PingOperator;
use crate::pool::BufferPool;
use crate::{mux_debug, mux_info, mux_warn};

/// One multiplexed connection to a server.
///
/// Requests from this side carry odd correlation ids. The server may issue
/// its own requests over the same connection; they go to `handler`.
pub struct Client<C: Codec> {
    cfg: ClientConfig,
    dispatcher: Arc<Dispatcher<C>>,
    ping: Arc<PingOperator<C::Message>>,
    token: Arc<Token<C::Message>>,
    events_tx: Sender<ClientEvent>,
    events_rx: Receiver<ClientEvent>,
    runtime: Handle,
}

impl<C: Codec> Client<C> {
    pub async fn connect<H>(cfg: &ClientConfig, codec: C, handler: H) -> io::Result<Self>
    where
        H: MessageHandler<C::Message>,
    {
        let pool = Arc::new(BufferPool::new(cfg.net.buffer_size, cfg.net.pool_capacity));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(codec),
            Arc::new(handler),
            pool,
            cfg.net.send_timeout(),
        ));
        let ping = Arc::new(PingOperator::new(cfg.net.ping_options()));

        // Channel for connection events
        let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(cfg.event_capacity.max(1));

        let token = Self::open(cfg, &dispatcher, &ping, &events_tx).await?;

        Ok(Self {
            cfg: cfg.clone(),
            dispatcher,
            ping,
            token,
            events_tx,
            events_rx,
            runtime: Handle::current(),
        })
    }

    async fn open(
        cfg: &ClientConfig,
        dispatcher: &Arc<Dispatcher<C>>,
        ping: &Arc<PingOperator<C::Message>>,
        events_tx: &Sender<ClientEvent>,
    ) -> io::Result<Arc<Token<C::Message>>> {
        let stream = timeout(cfg.connect_timeout(), TcpStream::connect(cfg.address()))
            .await
            .map_err(|_| {
                io::Error::new(
                    ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", cfg.address(), cfg.connect_timeout()),
                )
            })??;

        let transport = Transport::from_tcp(stream, cfg.no_delay(), cfg.net.transport_options())?;
        let token = Arc::new(Token::new(transport, Origin::Client, cfg.net.max_pending));
        let client_id = token.id();
        let remote = token.remote_addr();
        mux_info!("Connected to {} as {}", remote, client_id);

        if let Err(e) = events_tx.try_send(ClientEvent::Connected { client_id, remote }) {
            mux_warn!("Connected event for {} dropped: {}", client_id, e);
        }

        if cfg.net.keep_alive {
            ping.attach(token.clone());
        }

        tokio::spawn({
            let dispatcher = dispatcher.clone();
            let ping = ping.clone();
            let token = token.clone();
            let events_tx = events_tx.clone();
            async move {
                dispatcher.serve(token).await;
                ping.detach(client_id);
                // waits for room; fails only once the client and its receiver are gone
                if events_tx.send(ClientEvent::Disconnected { client_id, remote }).await.is_err() {
                    mux_debug!("Disconnected event for {} not delivered", client_id);
                }
            }
        });

        Ok(token)
    }

    #[inline] pub fn id(&self) -> Uuid                { self.token.id() }
    #[inline] pub fn remote_addr(&self) -> SocketAddr { self.token.remote_addr() }
    #[inline] pub fn is_connected(&self) -> bool      { self.token.is_connected() }
    #[inline] pub fn pending_count(&self) -> usize    { self.token.pending_count() }
    #[inline] pub fn config(&self) -> &ClientConfig   { &self.cfg }

    pub fn is_keep_alive_running(&self) -> bool {
        self.ping.is_running()
    }

    /// Sends a request with the configured default timeout.
    pub async fn send(&self, message: C::Message) -> Result<C::Message, NetError> {
        self.send_timeout(message, self.cfg.net.send_timeout()).await
    }

    pub async fn send_timeout(&self, message: C::Message, timeout: Duration) -> Result<C::Message, NetError> {
        self.dispatcher.send(&self.token, message, timeout).await
    }

    /// Resolves to [`NetError::Canceled`] once `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        message: C::Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<C::Message, NetError> {
        self.dispatcher
            .send_with_cancel(&self.token, message, timeout, Some(cancel))
            .await
    }

    pub async fn call<R>(&self, message: C::Message) -> Result<R, NetError>
    where
        R: TryFrom<C::Message>,
    {
        self.dispatcher.call(&self.token, message, self.cfg.net.send_timeout()).await
    }

    pub async fn post(&self, message: C::Message) -> Result<(), NetError> {
        self.dispatcher.post(&self.token, message, self.cfg.net.send_timeout()).await
    }

    pub async fn ping(&self) -> Result<Duration, NetError> {
        self.token.ping(self.cfg.net.ping_options().timeout).await
    }

    /// Blocking [`send`](Self::send) for threads outside the runtime.
    ///
    /// Must not be called from async code: it parks the calling thread.
    pub fn send_blocking(&self, message: C::Message) -> Result<C::Message, NetError> {
        let _runtime = self.runtime.enter();
        futures::executor::block_on(self.send(message))
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events_rx.recv().await
    }

    /// Drops the connection; outstanding requests fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.token.disconnect();
    }

    pub async fn reconnect(&mut self) -> io::Result<()> {
        self.token.disconnect();
        let mut delay = Duration::from_secs(1);

        loop {
            match Self::open(&self.cfg, &self.dispatcher, &self.ping, &self.events_tx).await {
                Ok(token) => {
                    mux_info!("Reconnect to {} successful", token.remote_addr());
                    self.token = token;
                    return Ok(());
                }
                Err(e) => {
                    mux_warn!("Reconnect failed: {e}. Retrying in {delay:?}");
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(60));
                }
            }
        }
    }
}

impl<C: Codec> Drop for Client<C> {
    fn drop(&mut self) {
        self.token.disconnect();
    }
}
