//! Channel transport seam.
//!
//! The supervisor only sees [`ChannelTransport`] and [`ChannelConnection`];
//! [`WebSocketTransport`] is the production implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::policy::ABNORMAL_CLOSE;
use crate::config::Config;
use crate::errors::ChannelError;
use crate::observability::telemetry::redact_secrets;

/// Close frame without a status code.
const NO_STATUS_CLOSE: u16 = 1005;

/// What the supervisor reads off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// The connection ended with this close code
    Closed(u16),
}

#[async_trait]
pub trait ChannelConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// Next frame. Returns `Frame::Closed` once the peer is gone.
    async fn next_frame(&mut self) -> Frame;

    async fn close(&mut self, code: u16) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ChannelConnection>, ChannelError>;
}

pub struct WebSocketTransport {
    connect_timeout: Duration,
    api_key: Option<String>,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            api_key: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.reconnect.connect_timeout_secs),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ChannelConnection>, ChannelError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ChannelError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(url = %redact_secrets(url.as_str()), "Opening notification channel");
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| ChannelError::Connect(redact_secrets(&e.to_string())))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChannelConnection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Frame {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Frame::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    return Frame::Closed(frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS_CLOSE));
                }
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "Channel read failed");
                    return Frame::Closed(ABNORMAL_CLOSE);
                }
                None => return Frame::Closed(ABNORMAL_CLOSE),
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(""),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}
