//! WebSocket transport to a node.
//!
//! The connection state machine talks to a node through the [`Transport`]
//! trait, so that it can run against an in-memory transport in tests. The
//! [`WebSocketTransport`] implementation uses `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        self,
        client::ClientRequestBuilder,
        http::Uri,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::error::{Error, Result};

/// Frames received from a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close { code: u16, reason: String },
}

impl Frame {
    /// Close code when the node closed without a status.
    pub const NO_STATUS: u16 = 1005;
}

/// Sending half of a socket.
#[async_trait]
pub trait SocketWriter: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn ping(&mut self) -> Result<()>;

    /// Sends a close frame and closes the socket.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Receiving half of a socket.
#[async_trait]
pub trait SocketReader: Send {
    /// Returns the next frame, or `None` at the end of the stream.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

pub type Socket = (Box<dyn SocketWriter>, Box<dyn SocketReader>);

/// Everything needed to open a socket to a node.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub url: String,
    pub password: String,
    pub user_id: u64,
    pub client_name: String,
    pub timeout: Duration,
}

impl HandshakeRequest {
    /// Handshake headers, in the order they are sent.
    #[must_use]
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("Authorization", self.password.clone()),
            ("User-Id", self.user_id.to_string()),
            ("Client-Name", self.client_name.clone()),
        ]
    }
}

impl std::fmt::Debug for HandshakeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeRequest")
            .field("url", &self.url)
            .field("user_id", &self.user_id)
            .field("client_name", &self.client_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Why a socket could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The node could not be reached.
    #[error("connection failed: {0}")]
    Connector(Error),

    /// The node answered the upgrade request with a status other than 101.
    #[error("unexpected handshake status {0}")]
    Status(u16),
}

impl HandshakeError {
    /// Whether the node rejected the credentials.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status(401 | 403))
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Connector(e) => e,
            HandshakeError::Status(status) => Self::new(
                crate::error::ErrorKind::from_status(status),
                format!("handshake failed with status {status}"),
            ),
        }
    }
}

/// Opens sockets to nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: &HandshakeRequest)
        -> std::result::Result<Socket, HandshakeError>;
}

/// Transport over `tokio-tungstenite`.
#[derive(Copy, Clone, Debug, Default)]
pub struct WebSocketTransport;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        request: &HandshakeRequest,
    ) -> std::result::Result<Socket, HandshakeError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| HandshakeError::Connector(e.into()))?;

        let builder = request
            .headers()
            .into_iter()
            .fold(ClientRequestBuilder::new(uri), |builder, (key, value)| {
                builder.with_header(key, value)
            });

        let stream = match tokio::time::timeout(
            request.timeout,
            tokio_tungstenite::connect_async(builder),
        )
        .await
        {
            Ok(Ok((stream, response))) => {
                trace!("handshake response: {response:?}");
                stream
            }
            Ok(Err(tungstenite::Error::Http(response))) => {
                return Err(HandshakeError::Status(response.status().as_u16()));
            }
            Ok(Err(e)) => return Err(HandshakeError::Connector(e.into())),
            Err(e) => {
                return Err(HandshakeError::Connector(Error::deadline_exceeded(format!(
                    "handshake with {}: {e}",
                    request.url
                ))));
            }
        };

        let (sink, stream) = stream.split();
        let writer: Box<dyn SocketWriter> = Box::new(WebSocketWriter { sink });
        let reader: Box<dyn SocketReader> = Box::new(WebSocketReader { stream });
        Ok((writer, reader))
    }
}

struct WebSocketWriter {
    sink: SplitSink<Stream, Message>,
}

#[async_trait]
impl SocketWriter for WebSocketWriter {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink.send(Message::text(text)).await.map_err(Into::into)
    }

    async fn ping(&mut self) -> Result<()> {
        self.sink
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(Into::into)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };

        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {}
            Err(e) => return Err(e.into()),
        }

        match self.sink.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct WebSocketReader {
    stream: SplitStream<Stream>,
}

#[async_trait]
impl SocketReader for WebSocketReader {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                Ok(Message::Binary(data)) => Frame::Binary(data.to_vec()),
                Ok(Message::Ping(data)) => Frame::Ping(data.to_vec()),
                Ok(Message::Pong(_)) => Frame::Pong,
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame.map_or_else(
                        || (Frame::NO_STATUS, String::new()),
                        |frame| (u16::from(frame.code), frame.reason.as_str().to_owned()),
                    );
                    Frame::Close { code, reason }
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            };

            return Some(Ok(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn handshake_headers() {
        let request = HandshakeRequest {
            url: "ws://localhost:2333/v4/websocket".to_owned(),
            password: "youshallnotpass".to_owned(),
            user_id: 1234,
            client_name: "lavaclient/0.1.0".to_owned(),
            timeout: Duration::from_secs(10),
        };

        let headers = request.headers();
        assert_eq!(headers[0], ("Authorization", "youshallnotpass".to_owned()));
        assert_eq!(headers[1], ("User-Id", "1234".to_owned()));
        assert_eq!(headers[2], ("Client-Name", "lavaclient/0.1.0".to_owned()));
        assert!(!format!("{request:?}").contains("youshallnotpass"));
    }

    #[test]
    fn unauthorized_statuses() {
        assert!(HandshakeError::Status(401).is_unauthorized());
        assert!(HandshakeError::Status(403).is_unauthorized());
        assert!(!HandshakeError::Status(404).is_unauthorized());
        assert!(!HandshakeError::Connector(Error::unavailable("refused")).is_unauthorized());

        let err = Error::from(HandshakeError::Status(403));
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn invalid_urls_fail_to_connect() {
        let request = HandshakeRequest {
            url: "not a url".to_owned(),
            password: String::new(),
            user_id: 0,
            client_name: String::new(),
            timeout: Duration::from_secs(1),
        };

        let err = WebSocketTransport.connect(&request).await.err().unwrap();
        assert!(matches!(err, HandshakeError::Connector(_)));
    }
}
