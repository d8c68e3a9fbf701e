//! Implements WebSocket _client_ protocols for GraphQL subscriptions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use dashmap::DashMap;
use futures::Sink;
use futures::SinkExt;
use futures::Stream;
use futures::StreamExt;
use futures::future;
use futures::ready;
use futures::stream::SplitStream;
use pin_project_lite::pin_project;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::SubscriptionError;
use crate::graphql;

const CONNECTION_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// The WebSocket subprotocol name for the modern graphql-ws protocol.
/// See [`WebSocketProtocol::GraphqlWs`].
const GRAPHQL_WS_SUBPROTOCOL: &str = "graphql-transport-ws";
/// The WebSocket subprotocol name for the legacy subscriptions-transport-ws protocol.
/// See [`WebSocketProtocol::SubscriptionsTransportWs`].
const SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL: &str = "graphql-ws";

/// The subscription protocol spoken over a duplex connection.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, Copy)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketProtocol {
    /// The modern graphql-ws protocol. The subprotocol name is "graphql-transport-ws".
    #[default]
    GraphqlWs,
    /// The legacy subscriptions-transport-ws protocol. Confusingly, the
    /// subprotocol name is "graphql-ws".
    #[serde(rename = "graphql_transport_ws")]
    SubscriptionsTransportWs,
}

impl WebSocketProtocol {
    /// The subprotocol name to negotiate during the WebSocket upgrade.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            WebSocketProtocol::GraphqlWs => GRAPHQL_WS_SUBPROTOCOL,
            WebSocketProtocol::SubscriptionsTransportWs => SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL,
        }
    }

    /// Returns a subscription start message appropriate for the active protocol.
    fn subscribe(&self, id: String, payload: graphql::Request) -> ClientMessage {
        match self {
            WebSocketProtocol::GraphqlWs => ClientMessage::Subscribe { id, payload },
            WebSocketProtocol::SubscriptionsTransportWs => ClientMessage::OldStart { id, payload },
        }
    }

    /// Returns a subscription completion message appropriate for the active protocol.
    fn complete(&self, id: String) -> ClientMessage {
        match self {
            WebSocketProtocol::GraphqlWs => ClientMessage::Complete { id },
            WebSocketProtocol::SubscriptionsTransportWs => ClientMessage::OldStop { id },
        }
    }
}

/// WebSocket messages sent from the client.
///
/// Branches prefixed with "Old" are specific to the subscriptions-transport-ws
/// protocol, other branches are either part of the graphql-ws protocol or
/// shared by both protocols.
#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A new connection
    ConnectionInit {
        /// Optional init payload from the client
        payload: Option<Value>,
    },
    /// The start of a subscription in the graphql-ws protocol
    Subscribe {
        /// Message ID
        id: String,
        /// The GraphQL Request
        payload: graphql::Request,
    },
    /// The start of a subscription in the subscriptions-transport-ws protocol
    #[serde(rename = "start")]
    OldStart {
        /// Message ID
        id: String,
        /// The GraphQL Request
        payload: graphql::Request,
    },
    /// The end of a subscription in the graphql-ws protocol
    Complete {
        /// Message ID
        id: String,
    },
    /// The end of a subscription in the subscriptions-transport-ws protocol
    #[serde(rename = "stop")]
    OldStop {
        /// Message ID
        id: String,
    },
    /// Connection terminated by the client, only used in the
    /// subscriptions-transport-ws protocol.
    #[serde(rename = "connection_terminate")]
    OldConnectionTerminate,
    /// Close the websocket connection. This is an internal message, not part
    /// of either protocol.
    CloseSocket,
    /// Useful for detecting failed connections or other types of network
    /// probing.
    Ping {
        /// Additional details about the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// The response to the Ping message.
    Pong {
        /// Additional details about the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

/// WebSocket messages received from the server.
#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The server acknowledged the connection handshake.
    ConnectionAck,
    /// A subscription data frame. The message has type "next" in the
    /// graphql-ws protocol, and type "data" in the subscriptions-transport-ws
    /// protocol.
    #[serde(alias = "data")]
    Next {
        id: String,
        payload: graphql::Response,
    },
    /// A per-subscription execution error.
    Error {
        #[serde(default)]
        id: Option<String>,
        payload: ServerError,
    },
    /// The connection was refused or torn down by the server; ends the
    /// stream without raising.
    ConnectionError {
        #[serde(default)]
        payload: Option<Value>,
    },
    /// The server ended the subscription; a clean end of the stream.
    Complete { id: String },
    /// The connection is being terminated; a clean end of the stream.
    ConnectionTerminate,
    /// A keep-alive frame, consumed and discarded.
    #[serde(alias = "ka")]
    KeepAlive,
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum ServerError {
    Error(graphql::Error),
    Errors(Vec<graphql::Error>),
}

impl From<ServerError> for Vec<graphql::Error> {
    fn from(value: ServerError) -> Self {
        match value {
            ServerError::Error(e) => vec![e],
            ServerError::Errors(e) => e,
        }
    }
}

/// A discriminated event derived from one inbound frame.
enum StreamEvent {
    /// A payload yielded to the caller.
    Data(graphql::Response),
    /// A control frame consumed without producing a value.
    Heartbeat,
    /// A clean end of the stream.
    End,
}

impl ServerMessage {
    fn into_event(self) -> StreamEvent {
        match self {
            ServerMessage::Next { id: _, payload } => StreamEvent::Data(payload),
            ServerMessage::Error { id: _, payload } => StreamEvent::Data(
                graphql::Response::builder()
                    .errors(payload.into())
                    .build(),
            ),
            ServerMessage::Complete { .. }
            | ServerMessage::ConnectionError { .. }
            | ServerMessage::ConnectionTerminate => StreamEvent::End,
            ServerMessage::ConnectionAck
            | ServerMessage::KeepAlive
            | ServerMessage::Ping { .. }
            | ServerMessage::Pong { .. } => StreamEvent::Heartbeat,
        }
    }

    fn id(&self) -> Option<String> {
        match self {
            ServerMessage::ConnectionAck
            | ServerMessage::ConnectionError { .. }
            | ServerMessage::ConnectionTerminate
            | ServerMessage::KeepAlive
            | ServerMessage::Ping { .. }
            | ServerMessage::Pong { .. } => None,
            ServerMessage::Next { id, .. } | ServerMessage::Complete { id } => Some(id.to_string()),
            ServerMessage::Error { id, .. } => id.clone(),
        }
    }
}

/// The registry of live subscriptions, enabling bulk teardown.
///
/// Owned by the client session; insert-on-start, remove-on-end. This is the
/// only shared mutable state of the engine and tolerates concurrent
/// starts/ends.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: DashMap<String, oneshot::Sender<()>>,
}

impl SubscriptionRegistry {
    /// The number of live subscriptions.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// End every live subscription, independently of whether any individual
    /// end fails.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((id, signal)) = self.active.remove(&id) {
                tracing::info!("ending subscription {id}");
                let _ = signal.send(());
            }
        }
    }

    fn register(&self, id: String) -> oneshot::Receiver<()> {
        let (signal, sentinel) = oneshot::channel();
        self.active.insert(id, signal);
        sentinel
    }

    fn deregister(&self, id: &str) {
        self.active.remove(id);
    }
}

/// A duplex connection speaking a GraphQL WebSocket protocol, after the
/// `connection_init`/`connection_ack` handshake succeeded.
pub struct GraphqlWebSocket<S> {
    stream: S,
    id: String,
    protocol: WebSocketProtocol,
}

impl<S> std::fmt::Debug for GraphqlWebSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlWebSocket")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl<S> GraphqlWebSocket<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>>
        + Sink<ClientMessage>
        + Unpin
        + Send
        + 'static,
{
    /// Perform the connection handshake over an established duplex stream.
    ///
    /// Sends `connection_init` carrying the connection-level payload and
    /// blocks for exactly one protocol reply. Anything other than an
    /// acknowledgment rejects the connection: the handshake aborts, nothing
    /// is registered, and no start frame is ever sent.
    pub async fn connect(
        mut stream: S,
        id: String,
        protocol: WebSocketProtocol,
        connection_params: Option<Value>,
    ) -> Result<Self, SubscriptionError> {
        stream
            .send(ClientMessage::ConnectionInit {
                payload: connection_params,
            })
            .await
            .map_err(|_err| SubscriptionError::ConnectionClosed)?;

        let first_protocol_frame = async {
            loop {
                match stream.next().await {
                    Some(Ok(ServerMessage::Ping { .. })) => {
                        // Some servers probe the connection before they ack it;
                        // the transport layer answers these on its own.
                    }
                    other => {
                        return other;
                    }
                }
            }
        };

        let reply = tokio::time::timeout(CONNECTION_ACK_TIMEOUT, first_protocol_frame)
            .await
            .map_err(|_| SubscriptionError::AckTimedOut)?;

        match reply {
            Some(Ok(ServerMessage::ConnectionAck)) => {
                tracing::debug!("subscription connection acknowledged");
                Ok(Self {
                    stream,
                    id,
                    protocol,
                })
            }
            Some(Ok(other)) => Err(SubscriptionError::ConnectionRejected {
                reason: format!("expected connection_ack, got: {other:?}"),
            }),
            Some(Err(err)) => Err(err),
            None => Err(SubscriptionError::ConnectionClosed),
        }
    }

    /// Send the protocol's start frame and expose the subscription as a lazy,
    /// single-pass sequence of responses.
    ///
    /// When a registry is given the subscription is inserted on start and
    /// removed once it ends, making it reachable for bulk teardown.
    pub async fn into_subscription(
        mut self,
        request: graphql::Request,
        registry: Option<Arc<SubscriptionRegistry>>,
    ) -> Result<SubscriptionStream<S>, SubscriptionError> {
        self.stream
            .send(self.protocol.subscribe(self.id.clone(), request))
            .await
            .map(|_| SubscriptionStream::new(self.stream, self.id, self.protocol, registry))
            .map_err(|_err| SubscriptionError::ConnectionClosed)
    }
}

/// Convert a bidirectional stream of untyped websocket packets to a [`Stream`]
/// + [`Sink`] that speaks the GraphQL WebSocket protocol ([`ServerMessage`]
/// and [`ClientMessage`]).
pub fn convert_websocket_stream<T>(
    stream: WebSocketStream<T>,
    id: String,
) -> impl Stream<Item = Result<ServerMessage, SubscriptionError>>
+ Sink<ClientMessage, Error = SubscriptionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    stream
        // Serialize messages being written into the `Sink`
        .with(|client_message: ClientMessage| match client_message {
            ClientMessage::CloseSocket => future::ready(Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Default::default(),
            })))),
            message => future::ready(
                serde_json::to_string(&message)
                    .map(Message::text)
                    .map_err(SubscriptionError::from),
            ),
        })
        // Parse messages received from the `Stream`
        .map(move |message| match message {
            Ok(Message::Text(text)) => {
                serde_json::from_str(&text).map_err(SubscriptionError::from)
            }
            Ok(Message::Ping(_)) => {
                // websocket-level probe; tungstenite replies on its own
                Ok(ServerMessage::Ping { payload: None })
            }
            Ok(Message::Pong(_)) => Ok(ServerMessage::Pong { payload: None }),
            Ok(Message::Close(None)) => Ok(ServerMessage::Complete { id: id.clone() }),
            Ok(Message::Close(Some(CloseFrame { code, reason }))) => {
                if code == CloseCode::Normal {
                    Ok(ServerMessage::Complete { id: id.clone() })
                } else {
                    Err(SubscriptionError::Protocol {
                        reason: format!(
                            "connection closed with error code '{code}' and reason '{reason}'"
                        ),
                    })
                }
            }
            Ok(other) => Err(SubscriptionError::Protocol {
                reason: format!("expected a text frame, got: {other:?}"),
            }),
            Err(err) => Err(SubscriptionError::WebSocket(err)),
        })
}

/// A lazy, single-pass sequence of subscription responses.
///
/// Once exhausted, naturally or via [`SubscriptionStream::close`], it can not
/// be iterated again; a new subscription must be started for further data.
pub struct SubscriptionStream<S> {
    inner_stream: SplitStream<InnerStream<S>>,
    id: String,
    close_signal: Option<oneshot::Sender<()>>,
}

impl<S> SubscriptionStream<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>>
        + Sink<ClientMessage>
        + Unpin
        + Send
        + 'static,
{
    pub(crate) fn new(
        stream: S,
        id: String,
        protocol: WebSocketProtocol,
        registry: Option<Arc<SubscriptionRegistry>>,
    ) -> Self {
        let (mut sink, inner_stream) = InnerStream::new(stream, id.clone(), protocol).split();
        let (close_signal, close_sentinel) = oneshot::channel::<()>();
        let registry_sentinel = registry.as_ref().map(|registry| registry.register(id.clone()));

        let task_id = id.clone();
        tokio::spawn(async move {
            // Wake on whichever comes first: the stream being closed or
            // dropped, or a bulk teardown through the registry.
            match registry_sentinel {
                Some(registry_sentinel) => {
                    let _ = future::select(close_sentinel, registry_sentinel).await;
                }
                None => {
                    let _ = close_sentinel.await;
                }
            }
            if let Some(registry) = registry {
                registry.deregister(&task_id);
            }
            if let Err(err) = sink.close().await {
                tracing::trace!("cannot close the websocket stream: {err:?}");
            }
        });

        Self {
            inner_stream,
            id,
            close_signal: Some(close_signal),
        }
    }
}

impl<S> SubscriptionStream<S> {
    /// The subscription correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Explicitly end the subscription: the protocol stop frame is sent for
    /// this id, then the socket is closed.
    ///
    /// Safe to call on an already ended stream.
    pub fn close(&mut self) {
        if let Some(close_signal) = self.close_signal.take()
            && close_signal.send(()).is_err()
        {
            tracing::trace!("subscription {} already closed", self.id);
        }
    }
}

impl<S> Drop for SubscriptionStream<S> {
    fn drop(&mut self) {
        if let Some(close_signal) = self.close_signal.take()
            && close_signal.send(()).is_err()
        {
            tracing::trace!("cannot close the websocket stream");
        }
    }
}

impl<S> Stream for SubscriptionStream<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>> + Sink<ClientMessage> + Unpin,
{
    type Item = Result<graphql::Response, SubscriptionError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.inner_stream.poll_next_unpin(cx)
    }
}

pin_project! {
    /// A wrapper over a stream + sink speaking a GraphQL websocket protocol that:
    /// - filters out frames not related to this stream's subscription ID
    /// - discards keep-alive frames without producing a value
    /// - ends the stream cleanly on complete/connection_error/connection_terminate
    /// - surfaces protocol violations as a terminal error item
    /// - handles connection shutdown according to the active protocol
    struct InnerStream<S> {
        #[pin]
        stream: S,
        id: String,
        protocol: WebSocketProtocol,
        // Booleans for the state machine when closing the stream
        completed: bool,
        terminated: bool,
        // When the websocket stream is closed (!= graphql sub protocol)
        closed: bool,
        // A protocol violation was surfaced; the stream is fused
        failed: bool,
    }
}

impl<S> InnerStream<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>> + Sink<ClientMessage> + Unpin,
{
    fn new(stream: S, id: String, protocol: WebSocketProtocol) -> Self {
        Self {
            stream,
            id,
            protocol,
            completed: false,
            terminated: false,
            closed: false,
            failed: false,
        }
    }
}

impl<S> Stream for InnerStream<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>> + Sink<ClientMessage> + Unpin,
{
    type Item = Result<graphql::Response, SubscriptionError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            let mut this = self.as_mut().project();

            if *this.failed {
                return Poll::Ready(None);
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(err)) => {
                    tracing::error!("fatal subscription protocol failure: {err}");
                    *this.failed = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Some(Ok(message)) => {
                    if let Some(id) = message.id()
                        && &id != this.id
                    {
                        // another subscription multiplexed on this connection
                        tracing::trace!("skipping frame for subscription {id}");
                        continue;
                    }
                    if let ServerMessage::Ping { .. } = &message {
                        // Answer protocol-level pings asynchronously
                        let _ = Pin::new(
                            &mut this.stream.as_mut().send(ClientMessage::Pong { payload: None }),
                        )
                        .poll(cx);
                    }
                    match message.into_event() {
                        StreamEvent::Data(response) => return Poll::Ready(Some(Ok(response))),
                        StreamEvent::Heartbeat => continue,
                        StreamEvent::End => return Poll::Ready(None),
                    }
                }
            }
        }
    }
}

impl<S> Sink<ClientMessage> for InnerStream<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>> + Sink<ClientMessage> + Unpin,
{
    type Error = SubscriptionError;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        this.stream
            .as_mut()
            .poll_ready(cx)
            .map_err(|_err| SubscriptionError::ConnectionClosed)
    }

    fn start_send(self: Pin<&mut Self>, item: ClientMessage) -> Result<(), Self::Error> {
        let mut this = self.project();
        this.stream
            .as_mut()
            .start_send(item)
            .map_err(|_err| SubscriptionError::ConnectionClosed)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        this.stream
            .as_mut()
            .poll_flush(cx)
            .map_err(|_err| SubscriptionError::ConnectionClosed)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();

        if !*this.completed {
            match Pin::new(
                &mut this
                    .stream
                    .as_mut()
                    .send(this.protocol.complete(this.id.to_string())),
            )
            .poll(cx)
            {
                Poll::Ready(_) => {
                    *this.completed = true;
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }

        if let WebSocketProtocol::SubscriptionsTransportWs = this.protocol
            && !*this.terminated
        {
            match Pin::new(
                &mut this
                    .stream
                    .as_mut()
                    .send(ClientMessage::OldConnectionTerminate),
            )
            .poll(cx)
            {
                Poll::Ready(_) => {
                    *this.terminated = true;
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }

        if !*this.closed {
            // instead of just calling poll_close we also send a proper
            // CloseSocket event to indicate it is a normal close, not an error
            match Pin::new(&mut this.stream.as_mut().send(ClientMessage::CloseSocket)).poll(cx) {
                Poll::Ready(_) => {
                    *this.closed = true;
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }

        this.stream
            .as_mut()
            .poll_close(cx)
            .map_err(|_err| SubscriptionError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use axum::Router;
    use axum::extract::WebSocketUpgrade;
    use axum::extract::ws::Message as AxumWsMessage;
    use axum::routing::get;
    use futures::FutureExt;
    use http::HeaderValue;
    use serde_json_bytes::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use uuid::Uuid;

    use super::*;
    use crate::graphql::Request;
    use crate::graphql::Response;
    use crate::protocols::testing::ScriptedConnection;
    use crate::protocols::testing::pair;

    fn data_frame(id: &str, value: Value) -> ServerMessage {
        ServerMessage::Next {
            id: id.to_string(),
            payload: Response::builder().data(value).build(),
        }
    }

    async fn connected(
        protocol: WebSocketProtocol,
    ) -> (
        GraphqlWebSocket<ScriptedConnection>,
        futures::channel::mpsc::UnboundedSender<Result<ServerMessage, SubscriptionError>>,
        futures::channel::mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let (connection, inbound, mut outbound) = pair();
        inbound
            .unbounded_send(Ok(ServerMessage::ConnectionAck))
            .unwrap();
        let socket = GraphqlWebSocket::connect(connection, "sub-1".to_string(), protocol, None)
            .await
            .unwrap();
        // drain the connection_init frame so tests only observe what follows
        assert!(matches!(
            outbound.next().await.unwrap(),
            ClientMessage::ConnectionInit { .. }
        ));
        (socket, inbound, outbound)
    }

    #[test]
    fn frame_spellings_follow_the_protocols() {
        let request = Request::builder().query("subscription { events }").build();
        let subscribe = serde_json::to_value(
            WebSocketProtocol::GraphqlWs.subscribe("1".to_string(), request.clone()),
        )
        .unwrap();
        assert_eq!(subscribe["type"], "subscribe");

        let start = serde_json::to_value(
            WebSocketProtocol::SubscriptionsTransportWs.subscribe("1".to_string(), request),
        )
        .unwrap();
        assert_eq!(start["type"], "start");

        let stop = serde_json::to_value(
            WebSocketProtocol::SubscriptionsTransportWs.complete("1".to_string()),
        )
        .unwrap();
        assert_eq!(stop["type"], "stop");

        let keep_alive: ServerMessage = serde_json::from_str(r#"{"type":"ka"}"#).unwrap();
        assert!(matches!(keep_alive, ServerMessage::KeepAlive));

        let data: ServerMessage =
            serde_json::from_str(r#"{"type":"data","id":"1","payload":{"data":{"n":1}}}"#).unwrap();
        assert!(matches!(data, ServerMessage::Next { .. }));
    }

    #[tokio::test]
    async fn handshake_sends_options_and_awaits_ack() {
        let (connection, inbound, mut outbound) = pair();
        inbound
            .unbounded_send(Ok(ServerMessage::Ping { payload: None }))
            .unwrap();
        inbound
            .unbounded_send(Ok(ServerMessage::ConnectionAck))
            .unwrap();

        GraphqlWebSocket::connect(
            connection,
            "sub-1".to_string(),
            WebSocketProtocol::GraphqlWs,
            Some(json!({"token": "XXX"})),
        )
        .await
        .unwrap();

        let init = outbound.next().await.unwrap();
        match init {
            ClientMessage::ConnectionInit { payload } => {
                assert_eq!(payload, Some(json!({"token": "XXX"})));
            }
            other => panic!("expected connection_init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_handshake_never_sends_a_start_frame() {
        let (connection, inbound, mut outbound) = pair();
        inbound
            .unbounded_send(Ok(ServerMessage::ConnectionError {
                payload: Some(json!({"message": "unauthorized"})),
            }))
            .unwrap();

        let err = GraphqlWebSocket::connect(
            connection,
            "sub-1".to_string(),
            WebSocketProtocol::GraphqlWs,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::ConnectionRejected { ref reason } if reason.contains("unauthorized")
        ));

        let init = outbound.next().await.unwrap();
        assert!(matches!(init, ClientMessage::ConnectionInit { .. }));
        assert!(
            outbound.next().now_or_never().flatten().is_none(),
            "no start frame may follow a rejected handshake"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out_the_handshake() {
        let (connection, _inbound, _outbound) = pair();
        let err = GraphqlWebSocket::connect(
            connection,
            "sub-1".to_string(),
            WebSocketProtocol::GraphqlWs,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubscriptionError::AckTimedOut));
    }

    #[tokio::test]
    async fn streaming_yields_data_and_ends_cleanly() {
        let (socket, inbound, _outbound) = connected(WebSocketProtocol::GraphqlWs).await;
        inbound
            .unbounded_send(Ok(data_frame("sub-1", json!({"n": 1}))))
            .unwrap();
        inbound.unbounded_send(Ok(ServerMessage::KeepAlive)).unwrap();
        inbound
            .unbounded_send(Ok(data_frame("sub-1", json!({"n": 2}))))
            .unwrap();
        inbound
            .unbounded_send(Ok(ServerMessage::Complete {
                id: "sub-1".to_string(),
            }))
            .unwrap();

        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                None,
            )
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, Some(json!({"n": 1})));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, Some(json!({"n": 2})));
        assert!(stream.next().await.is_none(), "complete ends the stream");
    }

    #[tokio::test]
    async fn frames_for_other_subscriptions_are_skipped() {
        let (socket, inbound, _outbound) = connected(WebSocketProtocol::GraphqlWs).await;
        inbound
            .unbounded_send(Ok(data_frame("someone-else", json!({"n": 0}))))
            .unwrap();
        inbound
            .unbounded_send(Ok(data_frame("sub-1", json!({"n": 1}))))
            .unwrap();
        inbound
            .unbounded_send(Ok(ServerMessage::Complete {
                id: "sub-1".to_string(),
            }))
            .unwrap();

        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                None,
            )
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, Some(json!({"n": 1})));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn protocol_violation_is_a_terminal_error() {
        let (socket, inbound, _outbound) = connected(WebSocketProtocol::GraphqlWs).await;
        inbound
            .unbounded_send(Err(SubscriptionError::Protocol {
                reason: "expected a text frame, got: Binary(..)".to_string(),
            }))
            .unwrap();
        inbound
            .unbounded_send(Ok(data_frame("sub-1", json!({"n": 1}))))
            .unwrap();

        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                None,
            )
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(SubscriptionError::Protocol { .. })));
        assert!(
            stream.next().await.is_none(),
            "a violated stream is fused and yields nothing further"
        );
    }

    #[tokio::test]
    async fn server_error_frames_surface_as_error_responses() {
        let (socket, inbound, _outbound) = connected(WebSocketProtocol::GraphqlWs).await;
        inbound
            .unbounded_send(Ok(ServerMessage::Error {
                id: Some("sub-1".to_string()),
                payload: ServerError::Error(
                    graphql::Error::builder().message("boom").build(),
                ),
            }))
            .unwrap();

        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                None,
            )
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].message, "boom");
    }

    #[tokio::test]
    async fn closing_sends_exactly_one_stop_frame_then_the_socket_close() {
        let (socket, inbound, outbound) = connected(WebSocketProtocol::GraphqlWs).await;
        inbound
            .unbounded_send(Ok(ServerMessage::Complete {
                id: "sub-1".to_string(),
            }))
            .unwrap();

        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                None,
            )
            .await
            .unwrap();
        assert!(stream.next().await.is_none());

        stream.close();
        stream.close(); // idempotent on an already ended stream
        drop(stream);

        let sent: Vec<ClientMessage> = outbound.collect().await;
        assert!(matches!(sent[0], ClientMessage::Subscribe { .. }));
        let stops = sent
            .iter()
            .filter(|message| matches!(message, ClientMessage::Complete { id } if id == "sub-1"))
            .count();
        assert_eq!(stops, 1);
        assert!(matches!(sent.last(), Some(ClientMessage::CloseSocket)));
    }

    #[tokio::test]
    async fn legacy_protocol_close_also_terminates_the_connection() {
        let (socket, _inbound, outbound) =
            connected(WebSocketProtocol::SubscriptionsTransportWs).await;
        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                None,
            )
            .await
            .unwrap();
        stream.close();
        drop(stream);

        let sent: Vec<ClientMessage> = outbound.collect().await;
        assert!(matches!(sent[0], ClientMessage::OldStart { .. }));
        assert!(
            sent.iter()
                .any(|message| matches!(message, ClientMessage::OldStop { id } if id == "sub-1"))
        );
        assert!(
            sent.iter()
                .any(|message| matches!(message, ClientMessage::OldConnectionTerminate))
        );
        assert!(matches!(sent.last(), Some(ClientMessage::CloseSocket)));
    }

    #[tokio::test]
    async fn close_all_ends_every_live_subscription() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let mut outbounds = Vec::new();
        let mut streams = Vec::new();
        for id in ["sub-1", "sub-2"] {
            let (connection, inbound, outbound) = pair();
            inbound
                .unbounded_send(Ok(ServerMessage::ConnectionAck))
                .unwrap();
            let socket = GraphqlWebSocket::connect(
                connection,
                id.to_string(),
                WebSocketProtocol::GraphqlWs,
                None,
            )
            .await
            .unwrap();
            let stream = socket
                .into_subscription(
                    Request::builder().query("subscription { n }").build(),
                    Some(registry.clone()),
                )
                .await
                .unwrap();
            outbounds.push(outbound);
            streams.push(stream);
        }
        assert_eq!(registry.len(), 2);

        registry.close_all();
        assert!(registry.is_empty());

        for (mut outbound, id) in outbounds.into_iter().zip(["sub-1", "sub-2"]) {
            // handshake and subscribe frames first, then the shutdown sequence
            assert!(matches!(
                outbound.next().await.unwrap(),
                ClientMessage::ConnectionInit { .. }
            ));
            assert!(matches!(
                outbound.next().await.unwrap(),
                ClientMessage::Subscribe { .. }
            ));
            assert!(matches!(
                outbound.next().await.unwrap(),
                ClientMessage::Complete { id: ref stopped } if stopped == id
            ));
            assert!(matches!(
                outbound.next().await.unwrap(),
                ClientMessage::CloseSocket
            ));
        }
        drop(streams);
    }

    #[tokio::test]
    async fn natural_end_deregisters_after_drop() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let (connection, inbound, mut outbound) = pair();
        inbound
            .unbounded_send(Ok(ServerMessage::ConnectionAck))
            .unwrap();
        inbound
            .unbounded_send(Ok(ServerMessage::Complete {
                id: "sub-1".to_string(),
            }))
            .unwrap();
        let socket = GraphqlWebSocket::connect(
            connection,
            "sub-1".to_string(),
            WebSocketProtocol::GraphqlWs,
            None,
        )
        .await
        .unwrap();
        let mut stream = socket
            .into_subscription(
                Request::builder().query("subscription { n }").build(),
                Some(registry.clone()),
            )
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(registry.len(), 1);

        drop(stream);
        // the closer task deregisters before shutting the sink down
        assert!(matches!(
            outbound.next().await.unwrap(),
            ClientMessage::ConnectionInit { .. }
        ));
        assert!(matches!(
            outbound.next().await.unwrap(),
            ClientMessage::Subscribe { .. }
        ));
        while let Some(message) = outbound.next().await {
            if matches!(message, ClientMessage::CloseSocket) {
                break;
            }
        }
        assert!(registry.is_empty());
    }

    async fn emulate_websocket_server_new_protocol() -> SocketAddr {
        let ws_handler = move |ws: WebSocketUpgrade| async move {
            let res = ws
                .protocols([GRAPHQL_WS_SUBPROTOCOL])
                .on_upgrade(move |mut socket| async move {
                    let init = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let init_msg: ClientMessage = serde_json::from_str(&init).unwrap();
                    if let ClientMessage::ConnectionInit { payload } = init_msg {
                        assert_eq!(payload, Some(json!({"token": "XXX"})));
                    } else {
                        panic!("it should be a connection init message");
                    }

                    socket
                        .send(AxumWsMessage::text(
                            serde_json::to_string(&ServerMessage::ConnectionAck).unwrap(),
                        ))
                        .await
                        .unwrap();

                    let subscribe = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let subscribe_msg: ClientMessage = serde_json::from_str(&subscribe).unwrap();
                    let client_id = if let ClientMessage::Subscribe { payload, id } = subscribe_msg
                    {
                        assert_eq!(
                            payload,
                            Request::builder()
                                .query("subscription { userWasCreated { username } }")
                                .build()
                        );
                        id
                    } else {
                        panic!("we should receive a subscribe message");
                    };

                    socket
                        .send(AxumWsMessage::text(
                            serde_json::to_string(&ServerMessage::Next {
                                id: client_id.clone(),
                                payload: Response::builder()
                                    .data(json!({"userWasCreated": {"username": "ada_lovelace"}}))
                                    .build(),
                            })
                            .unwrap(),
                        ))
                        .await
                        .unwrap();

                    socket
                        .send(AxumWsMessage::text(
                            serde_json::to_string(&ServerMessage::Complete { id: client_id })
                                .unwrap(),
                        ))
                        .await
                        .unwrap();

                    // shutdown sequence from the client
                    let stop = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let stop_msg: ClientMessage = serde_json::from_str(&stop).unwrap();
                    assert!(matches!(stop_msg, ClientMessage::Complete { .. }));
                });

            Ok::<_, Infallible>(res)
        };

        let app = Router::new().route("/ws", get(ws_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        tokio::spawn(async { axum::serve(listener, app).await.unwrap() });
        local_addr
    }

    #[tokio::test]
    async fn test_ws_connection_new_proto() {
        let socket_addr = emulate_websocket_server_new_protocol().await;
        let url = format!("ws://{socket_addr}/ws");
        let mut request = url.into_client_request().unwrap();
        request.headers_mut().insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(GRAPHQL_WS_SUBPROTOCOL),
        );
        let (ws_stream, _resp) = connect_async(request).await.unwrap();

        let sub_uuid = Uuid::new_v4().to_string();
        let gql_socket = GraphqlWebSocket::connect(
            convert_websocket_stream(ws_stream, sub_uuid.clone()),
            sub_uuid,
            WebSocketProtocol::GraphqlWs,
            Some(json!({"token": "XXX"})),
        )
        .await
        .unwrap();

        let mut gql_read_stream = gql_socket
            .into_subscription(
                Request::builder()
                    .query("subscription { userWasCreated { username } }")
                    .build(),
                None,
            )
            .await
            .unwrap();

        let next_payload = gql_read_stream.next().await.unwrap().unwrap();
        assert_eq!(
            next_payload,
            Response::builder()
                .data(json!({"userWasCreated": {"username": "ada_lovelace"}}))
                .build()
        );
        assert!(gql_read_stream.next().await.is_none(), "it should be completed");
    }

    async fn emulate_websocket_server_old_protocol() -> SocketAddr {
        let ws_handler = move |ws: WebSocketUpgrade| async move {
            let res = ws
                .protocols([SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL])
                .on_upgrade(move |mut socket| async move {
                    let init = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let init_msg: ClientMessage = serde_json::from_str(&init).unwrap();
                    assert!(matches!(init_msg, ClientMessage::ConnectionInit { .. }));

                    socket
                        .send(AxumWsMessage::text(
                            serde_json::to_string(&ServerMessage::ConnectionAck).unwrap(),
                        ))
                        .await
                        .unwrap();
                    socket
                        .send(AxumWsMessage::text(
                            serde_json::to_string(&ServerMessage::KeepAlive).unwrap(),
                        ))
                        .await
                        .unwrap();

                    let start = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let start_msg: ClientMessage = serde_json::from_str(&start).unwrap();
                    let client_id = if let ClientMessage::OldStart { id, .. } = start_msg {
                        id
                    } else {
                        panic!("we should receive a start message");
                    };

                    socket
                        .send(AxumWsMessage::text(
                            serde_json::to_string(&ServerMessage::Next {
                                id: client_id.clone(),
                                payload: Response::builder()
                                    .data(json!({"userWasCreated": {"username": "ada_lovelace"}}))
                                    .build(),
                            })
                            .unwrap(),
                        ))
                        .await
                        .unwrap();

                    let stop = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let stop_msg: ClientMessage = serde_json::from_str(&stop).unwrap();
                    assert!(matches!(stop_msg, ClientMessage::OldStop { .. }));

                    let terminate = socket.recv().await.unwrap().unwrap().into_text().unwrap();
                    let terminate_msg: ClientMessage = serde_json::from_str(&terminate).unwrap();
                    assert!(matches!(terminate_msg, ClientMessage::OldConnectionTerminate));

                    socket.close().await.unwrap();
                });

            Ok::<_, Infallible>(res)
        };

        let app = Router::new().route("/ws", get(ws_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        tokio::spawn(async { axum::serve(listener, app).await.unwrap() });
        local_addr
    }

    #[tokio::test]
    async fn test_ws_connection_old_proto() {
        let socket_addr = emulate_websocket_server_old_protocol().await;
        let url = format!("ws://{socket_addr}/ws");
        let mut request = url.into_client_request().unwrap();
        request.headers_mut().insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL),
        );
        let (ws_stream, _resp) = connect_async(request).await.unwrap();

        let sub_uuid = Uuid::new_v4().to_string();
        let gql_socket = GraphqlWebSocket::connect(
            convert_websocket_stream(ws_stream, sub_uuid.clone()),
            sub_uuid,
            WebSocketProtocol::SubscriptionsTransportWs,
            None,
        )
        .await
        .unwrap();

        let mut gql_read_stream = gql_socket
            .into_subscription(
                Request::builder()
                    .query("subscription { userWasCreated { username } }")
                    .build(),
                None,
            )
            .await
            .unwrap();

        let next_payload = gql_read_stream.next().await.unwrap().unwrap();
        assert_eq!(
            next_payload,
            Response::builder()
                .data(json!({"userWasCreated": {"username": "ada_lovelace"}}))
                .build()
        );

        gql_read_stream.close();
    }
}
