//! WebSocket client.
//!
//! This module provides a Tandem client over tokio-tungstenite. Connecting
//! retries per [`ReconnectPolicy`] and completes once the server's
//! `connected` greeting has been read. When an established connection drops
//! and the policy allows retries, [`SyncClient::next_event`] reconnects and
//! rejoins the last joined document.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tandem_protocol::{
    codec, ChangeEvent, ClientEvent, Membership, ServerEvent, Welcome, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::reconnect::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Encoding used for outgoing events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    MessagePack,
}

/// A connected Tandem client.
pub struct SyncClient {
    url: String,
    policy: ReconnectPolicy,
    stream: WsStream,
    welcome: Welcome,
    format: WireFormat,
    read_buffer: BytesMut,
    /// Replayed after a reconnect.
    membership: Option<Membership>,
    closed: bool,
}

impl SyncClient {
    /// Connect to `url`, retrying per `policy`.
    ///
    /// # Errors
    ///
    /// Returns `RetriesExhausted` once the policy gives up, or a handshake
    /// error if the server's greeting is missing or incompatible.
    pub async fn connect(url: &str, policy: &ReconnectPolicy) -> Result<Self, TransportError> {
        let (stream, welcome, read_buffer) = open(url, policy).await?;

        Ok(Self {
            url: url.to_string(),
            policy: *policy,
            stream,
            welcome,
            format: WireFormat::default(),
            read_buffer,
            membership: None,
            closed: false,
        })
    }

    /// Replace the connection with a fresh one and rejoin the last joined
    /// document.
    ///
    /// # Errors
    ///
    /// Returns `RetriesExhausted` once the policy gives up, or a send error if
    /// the rejoin cannot be written.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        let (stream, welcome, read_buffer) = open(&self.url, &self.policy).await?;
        info!(
            previous = %self.welcome.connection_id,
            connection = %welcome.connection_id,
            "Reconnected"
        );

        self.stream = stream;
        self.welcome = welcome;
        self.read_buffer = read_buffer;
        self.closed = false;

        if let Some(membership) = self.membership.clone() {
            debug!(document = %membership.document_id, "Rejoining after reconnect");
            self.send(&ClientEvent::Join(membership)).await?;
        }
        Ok(())
    }

    /// Server-assigned connection id.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.welcome.connection_id
    }

    /// Heartbeat interval recommended by the server, in milliseconds.
    #[must_use]
    pub fn heartbeat_ms(&self) -> u32 {
        self.welcome.heartbeat
    }

    /// Choose the encoding for outgoing events.
    pub fn set_format(&mut self, format: WireFormat) {
        self.format = format;
    }

    /// Join a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be sent.
    pub async fn join(&mut self, document_id: &str, user_id: &str) -> Result<(), TransportError> {
        self.send(&ClientEvent::Join(Membership::new(document_id, user_id)))
            .await
    }

    /// Leave a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be sent.
    pub async fn leave(&mut self, document_id: &str, user_id: &str) -> Result<(), TransportError> {
        self.send(&ClientEvent::Leave(Membership::new(document_id, user_id)))
            .await
    }

    /// Send a full-content edit.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be sent.
    pub async fn send_change(&mut self, change: ChangeEvent) -> Result<(), TransportError> {
        self.send(&ClientEvent::Change(change)).await
    }

    /// Send any client event.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or sending fails.
    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        let message = match self.format {
            WireFormat::Json => Message::Text(codec::encode_json(event)?),
            WireFormat::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
        };

        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        match event {
            ClientEvent::Join(m) => self.membership = Some(m.clone()),
            ClientEvent::Leave(m)
                if self
                    .membership
                    .as_ref()
                    .is_some_and(|joined| joined.document_id == m.document_id) =>
            {
                self.membership = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Receive the next server event.
    ///
    /// Returns `None` once the connection is closed and cannot be restored.
    /// With a retrying policy a dropped connection is reconnected first.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, undecodable frames, or when
    /// reconnecting gives up.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, TransportError> {
        loop {
            let can_reconnect = !self.closed && self.policy.retries();

            match read_event(&mut self.stream, &mut self.read_buffer).await {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) if !can_reconnect => return Ok(None),
                Err(e) if !can_reconnect || !e.is_disconnect() => return Err(e),
                Ok(None) => {
                    warn!(connection = %self.welcome.connection_id, "Connection dropped, reconnecting");
                    self.reconnect().await?;
                }
                Err(e) => {
                    warn!(connection = %self.welcome.connection_id, error = %e, "Connection lost, reconnecting");
                    self.reconnect().await?;
                }
            }
        }
    }

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be sent.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// Connect with retries and read the greeting.
async fn open(
    url: &str,
    policy: &ReconnectPolicy,
) -> Result<(WsStream, Welcome, BytesMut), TransportError> {
    let mut failures = 0u32;

    loop {
        let reason = match connect_async(url).await {
            Ok((stream, _)) => {
                debug!("WebSocket handshake completed with {}", url);
                match handshake(stream).await {
                    Err(e) if e.is_disconnect() => e.to_string(),
                    result => return result,
                }
            }
            Err(e) => e.to_string(),
        };

        failures += 1;
        match policy.delay_for(failures) {
            Some(delay) => {
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                return Err(TransportError::RetriesExhausted {
                    attempts: failures,
                    reason,
                });
            }
        }
    }
}

async fn handshake(mut stream: WsStream) -> Result<(WsStream, Welcome, BytesMut), TransportError> {
    let mut read_buffer = BytesMut::with_capacity(4096);

    match read_event(&mut stream, &mut read_buffer).await? {
        Some(ServerEvent::Connected(welcome)) => {
            if !PROTOCOL_VERSION.accepts_major(welcome.version) {
                return Err(TransportError::Incompatible(welcome.version));
            }
            info!(connection = %welcome.connection_id, "Connected");
            Ok((stream, welcome, read_buffer))
        }
        Some(other) => Err(TransportError::UnexpectedEvent(other.name())),
        None => Err(TransportError::ConnectionClosed),
    }
}

/// Read one event, answering pings on the way. `None` means closed.
async fn read_event(
    stream: &mut WsStream,
    read_buffer: &mut BytesMut,
) -> Result<Option<ServerEvent>, TransportError> {
    loop {
        if let Some(event) = codec::decode_from(read_buffer)? {
            return Ok(Some(event));
        }

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return Ok(Some(codec::decode_json(&text)?));
            }
            Some(Ok(Message::Binary(data))) => {
                read_buffer.extend_from_slice(&data);
            }
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!("Failed to send pong: {}", e);
                }
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame");
                return Ok(None);
            }
            Some(Err(WsError::ConnectionClosed)) | None => {
                debug!("WebSocket stream ended");
                return Ok(None);
            }
            Some(Err(e)) => {
                return Err(TransportError::ReceiveFailed(e.to_string()));
            }
        }
    }
}
