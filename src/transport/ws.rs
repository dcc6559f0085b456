use crate::error::{Error, Result};
use super::relay::Credential;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

#[derive(Debug)]
pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    pub(crate) const fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self(stream)
    }
}

impl futures::Stream for WsStream {
    type Item = std::result::Result<
        tokio_tungstenite::tungstenite::Message,
        tokio_tungstenite::tungstenite::Error,
    >;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.0).poll_next(cx)
    }
}

impl futures::Sink<tokio_tungstenite::tungstenite::Message> for WsStream {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: tokio_tungstenite::tungstenite::Message,
    ) -> std::result::Result<(), Self::Error> {
        std::pin::Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

pub const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Open the live websocket, authenticating with a relay-issued credential.
///
/// # Errors
/// Returns `AuthFailure` if the endpoint rejects the credential during the
/// handshake, or a websocket error for any other handshake failure.
pub async fn connect(endpoint: &str, credential: &Credential) -> Result<WsStream> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut().append_pair("key", credential.expose());

    let req = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
        url.as_str(),
    )?;
    let (ws_stream, _) = connect_async(req).await.map_err(classify_handshake_error)?;

    tracing::info!(host = url.host_str().unwrap_or_default(), "Connected to live endpoint");

    Ok(WsStream::new(ws_stream))
}

fn classify_handshake_error(err: WsError) -> Error {
    match &err {
        WsError::Http(response) if is_auth_rejection(response.status().as_u16()) => {
            Error::AuthFailure(format!("live endpoint rejected credential ({})", response.status()))
        }
        _ => Error::WebSocket(err),
    }
}

const fn is_auth_rejection(status: u16) -> bool {
    matches!(status, 401 | 403)
}
