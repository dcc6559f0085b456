use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::LiveConfig;
use crate::protocol::server_events::ServerEvent;
use crate::transport::relay::{Credential, RelayClient};
use crate::transport::ws::LIVE_ENDPOINT;
use crate::{LiveClient, LiveReceiver, LiveSender, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::transport::{BoxFuture, Transport};

/// Acquires what a session needs from the network: a credential, then a stream.
#[async_trait::async_trait]
pub trait Connector: Send {
    /// # Errors
    /// Returns `AuthFailure` if no credential can be issued.
    async fn fetch_credential(&mut self) -> Result<Credential>;

    /// # Errors
    /// Returns `AuthFailure` if the credential is rejected, or a network error.
    async fn connect(&mut self, credential: &Credential, config: &LiveConfig) -> Result<Box<dyn Transport>>;
}

/// Fetches credentials from the relay and connects to the live websocket.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    relay: RelayClient,
    endpoint: String,
}

impl RelayConnector {
    #[must_use]
    pub fn new(relay: RelayClient) -> Self {
        Self { relay, endpoint: LIVE_ENDPOINT.to_string() }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait::async_trait]
impl Connector for RelayConnector {
    async fn fetch_credential(&mut self) -> Result<Credential> {
        self.relay.fetch_credential().await
    }

    async fn connect(&mut self, credential: &Credential, config: &LiveConfig) -> Result<Box<dyn Transport>> {
        let (sender, receiver) = LiveClient::connect(&self.endpoint, credential, config).await?.split();
        Ok(Box::new(WsTransport { sender: Arc::new(Mutex::new(sender)), receiver }))
    }
}

struct WsTransport {
    sender: Arc<Mutex<LiveSender>>,
    receiver: LiveReceiver,
}

impl Transport for WsTransport {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'static, Result<()>> {
        let sender = Arc::clone(&self.sender);
        Box::pin(async move { sender.lock().await.send(event).await })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerEvent>>> {
        Box::pin(async move { self.receiver.next_event().await })
    }
}
