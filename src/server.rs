use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::config::ServerConfig;
use crate::connection::{Dispatcher, Origin, Token, Transport};
use crate::error::NetError;
use crate::event::ServerEvent;
use crate::handler::MessageHandler;
use crate::ping::PingOperator;
use crate::pool::BufferPool;
use crate::{mux_debug, mux_error, mux_info, mux_warn};

/// Error types that can occur during server-wide operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerError {
    /// The message could not be encoded before broadcasting
    #[error("Failed to encode message for broadcast: {0}")]
    EncodingFailed(NetError),

    /// Every targeted client failed; they have been disconnected
    #[error("Failed to broadcast message to {} clients", .0.len())]
    BroadcastFailed(Vec<SocketAddr>),

    #[error("Server is already running")]
    AlreadyRunning,
}

/// Accepts connections and keeps one token per remote address.
///
/// Requests from this side carry even correlation ids.
pub struct Server<C: Codec> {
    cfg: ServerConfig,
    dispatcher: Arc<Dispatcher<C>>,
    ping: Arc<PingOperator<C::Message>>,
    clients: DashMap<SocketAddr, Arc<Token<C::Message>>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl<C: Codec> Server<C> {
    pub async fn bind<H>(cfg: ServerConfig, codec: C, handler: H) -> io::Result<Arc<Self>>
    where
        H: MessageHandler<C::Message>,
    {
        let listener = TcpListener::bind(cfg.address()).await?;
        let local_addr = listener.local_addr()?;
        mux_info!("Server bound to {}", local_addr);

        let pool = Arc::new(BufferPool::new(cfg.net.buffer_size, cfg.net.pool_capacity));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(codec),
            Arc::new(handler),
            pool,
            cfg.net.send_timeout(),
        ));
        let ping = Arc::new(PingOperator::new(cfg.net.ping_options()));

        Ok(Arc::new(Self {
            cfg,
            dispatcher,
            ping,
            clients: DashMap::new(),
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: CancellationToken::new(),
        }))
    }

    #[inline] pub fn local_addr(&self) -> SocketAddr { self.local_addr }
    #[inline] pub fn config(&self) -> &ServerConfig  { &self.cfg }

    pub fn connections(&self) -> Vec<SocketAddr> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.ping.is_running()
    }

    /// Accepts connections until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>, events: Sender<ServerEvent>) -> Result<(), ServerError> {
        let listener = self.listener.lock().await.take().ok_or(ServerError::AlreadyRunning)?;
        mux_info!("Accepting connections on {}", self.local_addr);

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => break,
            };

            match accepted {
                Ok((socket, addr)) => {
                    mux_debug!("Accepted connection from {}", addr);

                    let transport = match Transport::from_tcp(socket, self.cfg.no_delay(), self.cfg.net.transport_options()) {
                        Ok(transport) => transport,
                        Err(e) => {
                            mux_warn!("Dropping connection from {}: {:?}", addr, e);
                            let _ = events.try_send(ServerEvent::Error { remote: addr, error: e.to_string() });
                            continue;
                        }
                    };

                    let token = Arc::new(Token::new(transport, Origin::Server, self.cfg.net.max_pending));
                    if let Some(stale) = self.clients.insert(addr, token.clone()) {
                        stale.disconnect();
                    }

                    let server = Arc::clone(&self);
                    let events = events.clone();
                    tokio::spawn(async move {
                        server.connection_task(token, events).await;
                    });
                }
                Err(e) => {
                    mux_error!("Error accepting connection: {:?}", e);
                }
            }
        }

        mux_info!("Server on {} stopped accepting", self.local_addr);
        Ok(())
    }

    async fn connection_task(self: Arc<Self>, token: Arc<Token<C::Message>>, events: Sender<ServerEvent>) {
        let client_id = token.id();
        let remote = token.remote_addr();

        // The application hears about the client before any of its traffic is
        // read, but a stalled event reader must not stall the connection.
        if let Err(e) = events.try_send(ServerEvent::Connected { client_id, remote }) {
            mux_warn!("Connected event for {} dropped: {}", remote, e);
        }

        if self.cfg.net.keep_alive {
            self.ping.attach(token.clone());
        }

        self.dispatcher.clone().serve(token.clone()).await;

        self.clients.remove_if(&remote, |_, current| current.id() == client_id);
        self.ping.detach(client_id);
        mux_debug!("Client {} ({}) removed", client_id, remote);

        if let Err(e) = events.send(ServerEvent::Disconnected { client_id, remote }).await {
            mux_debug!("Disconnected event for {} not delivered: {:?}", remote, e);
        }
    }

    fn token(&self, addr: &SocketAddr) -> Result<Arc<Token<C::Message>>, NetError> {
        self.clients
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or(NetError::NotConnected(*addr))
    }

    pub async fn send_to(&self, addr: &SocketAddr, message: C::Message) -> Result<C::Message, NetError> {
        self.send_to_timeout(addr, message, self.cfg.net.send_timeout()).await
    }

    pub async fn send_to_timeout(
        &self,
        addr: &SocketAddr,
        message: C::Message,
        timeout: Duration,
    ) -> Result<C::Message, NetError> {
        let token = self.token(addr)?;
        self.dispatcher.send(&token, message, timeout).await
    }

    pub async fn send_to_with_cancel(
        &self,
        addr: &SocketAddr,
        message: C::Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<C::Message, NetError> {
        let token = self.token(addr)?;
        self.dispatcher.send_with_cancel(&token, message, timeout, Some(cancel)).await
    }

    pub async fn call_to<R>(&self, addr: &SocketAddr, message: C::Message) -> Result<R, NetError>
    where
        R: TryFrom<C::Message>,
    {
        let token = self.token(addr)?;
        self.dispatcher.call(&token, message, self.cfg.net.send_timeout()).await
    }

    pub async fn post_to(&self, addr: &SocketAddr, message: C::Message) -> Result<(), NetError> {
        let token = self.token(addr)?;
        self.dispatcher.post(&token, message, self.cfg.net.send_timeout()).await
    }

    pub async fn ping(&self, addr: &SocketAddr) -> Result<Duration, NetError> {
        let token = self.token(addr)?;
        token.ping(self.cfg.net.ping_options().timeout).await
    }

    /// Posts `message` to every client not in `exclude`.
    ///
    /// Clients whose write fails are disconnected. Returns how many clients
    /// received the message; fails only when every targeted client failed.
    pub async fn broadcast(
        &self,
        message: C::Message,
        exclude: Option<&HashSet<SocketAddr>>,
    ) -> Result<usize, ServerError> {
        let body = self.dispatcher.encode_body(message).map_err(ServerError::EncodingFailed)?;

        let targets: Vec<_> = self
            .clients
            .iter()
            .filter(|entry| exclude.map_or(true, |set| !set.contains(entry.key())))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        mux_debug!(
            "Broadcast start – {} B → {} clients ({} excluded)",
            body.len(),
            targets.len(),
            exclude.map_or(0, |s| s.len())
        );

        let timeout = self.cfg.net.send_timeout();
        let tasks = targets.iter().map(|(addr, token)| {
            let body = &body;
            async move {
                match self.dispatcher.post_encoded(token, body, timeout).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        mux_warn!("Broadcast FAIL → {addr}: {e}");
                        token.disconnect();
                        Err(*addr)
                    }
                }
            }
        });

        let results = join_all(tasks).await;
        let failed: Vec<SocketAddr> = results.into_iter().filter_map(Result::err).collect();
        let delivered = targets.len() - failed.len();

        if !failed.is_empty() && delivered == 0 {
            return Err(ServerError::BroadcastFailed(failed));
        }
        mux_debug!("Broadcast done → {} delivered, {} failed", delivered, failed.len());
        Ok(delivered)
    }

    /// Drops the connection to `addr`; returns whether it existed.
    pub fn disconnect(&self, addr: &SocketAddr) -> bool {
        let Some(token) = self.clients.get(addr).map(|entry| entry.value().clone()) else {
            return false;
        };
        token.disconnect();
        true
    }

    /// Stops accepting and disconnects every client.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.clients.iter() {
            entry.value().disconnect();
        }
    }
}

impl<C: Codec> Drop for Server<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
