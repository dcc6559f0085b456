use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerEvent;
use crate::Result;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One duplex stream to the live endpoint.
///
/// `send` hands back a future that owns the outbound message, so the caller
/// can keep reading with `next_event` while a slow write is still draining.
/// `next_event` yields `Ok(None)` once the server closed the stream. Dropping
/// the transport disconnects it.
pub trait Transport: Send {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'static, Result<()>>;
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerEvent>>>;
}
