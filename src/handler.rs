use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;

use crate::error::BoxError;

/// Produces the response to an inbound request.
///
/// `Ok(None)` is answered with a not-supported reply, `Err` with a handler
/// error carrying the error text. The handler runs on the connection's
/// receive loop: the next frame from that peer is not read until it returns.
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, remote: SocketAddr, message: M) -> Result<Option<M>, BoxError>;
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(SocketAddr, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<M>, BoxError>> + Send + 'static,
{
    async fn handle(&self, remote: SocketAddr, message: M) -> Result<Option<M>, BoxError> {
        (self)(remote, message).await
    }
}

/// Answers every request with "not supported".
#[derive(Clone, Copy, Debug, Default)]
pub struct Unsupported;

#[async_trait]
impl<M: Send + 'static> MessageHandler<M> for Unsupported {
    async fn handle(&self, _remote: SocketAddr, _message: M) -> Result<Option<M>, BoxError> {
        Ok(None)
    }
}
