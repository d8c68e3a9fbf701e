//! The client facade: unary execution and subscription startup over a
//! pluggable transport.

use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use futures::Sink;
use futures::Stream;
use futures::StreamExt;
use serde_json_bytes::Value;
use uuid::Uuid;

use crate::error::BoxError;
use crate::error::ClientError;
use crate::error::SubscriptionError;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::graphql::SubscriptionRequest;
use crate::operation::Operation;
use crate::operation::OperationKind;
use crate::plugin;
use crate::plugin::Plugin;
use crate::protocols::websocket::ClientMessage;
use crate::protocols::websocket::GraphqlWebSocket;
use crate::protocols::websocket::ServerMessage;
use crate::protocols::websocket::SubscriptionRegistry;
use crate::protocols::websocket::SubscriptionStream;
use crate::protocols::websocket::WebSocketProtocol;
use crate::schema::Schema;

/// The transport collaborator contract.
///
/// A transport exposes the two shapes the client depends on: a single
/// request/response `post` for query and mutation execution, and a duplex
/// typed frame connection for subscriptions. Connection establishment,
/// TLS and socket-level retries all live behind this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The duplex connection type used for subscriptions, e.g. the result of
    /// [`convert_websocket_stream`](crate::protocols::websocket::convert_websocket_stream).
    type Connection: Stream<Item = Result<ServerMessage, SubscriptionError>>
        + Sink<ClientMessage>
        + Unpin
        + Send
        + 'static;

    /// Send one serialized request payload and return the raw response body.
    async fn post(&self, body: String) -> Result<String, BoxError>;

    /// Open a duplex connection negotiating the given subscription protocol.
    async fn connect(&self, protocol: WebSocketProtocol) -> Result<Self::Connection, BoxError>;
}

/// A schema-aware GraphQL client.
///
/// Holds the parsed [`Schema`] every selection is validated against, the
/// transport, the plugin chain applied around unary executions, and the
/// registry of live subscriptions for bulk teardown.
pub struct Client<T: Transport> {
    schema: Schema,
    transport: T,
    plugins: Vec<Box<dyn Plugin>>,
    protocol: WebSocketProtocol,
    subscriptions: Arc<SubscriptionRegistry>,
}

#[buildstructor::buildstructor]
impl<T: Transport> Client<T> {
    /// Returns a builder that builds a [`Client`].
    ///
    /// Builder methods:
    ///
    /// * `.schema(`[`Schema`]`)` — required.
    /// * `.transport(T)` — required.
    /// * `.plugin(...)` / `.plugins(...)` — optional, applied in order.
    /// * `.protocol(`[`WebSocketProtocol`]`)` — optional, defaults to the
    ///   modern graphql-ws protocol.
    /// * `.build()`
    #[builder(visibility = "pub")]
    fn new(
        schema: Schema,
        transport: T,
        plugins: Vec<Box<dyn Plugin>>,
        protocol: Option<WebSocketProtocol>,
    ) -> Self {
        Self {
            schema,
            transport,
            plugins,
            protocol: protocol.unwrap_or_default(),
            subscriptions: Arc::new(SubscriptionRegistry::default()),
        }
    }

    /// The schema this client validates selections against.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The registry of live subscriptions started through this client.
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// End every subscription started through this client.
    pub fn close_all_subscriptions(&self) {
        self.subscriptions.close_all();
    }

    /// Validate and execute a query or mutation operation.
    pub async fn execute(&self, operation: Operation) -> Result<Response, ClientError> {
        if operation.kind == OperationKind::Subscription {
            return Err(ClientError::MalformedRequest {
                reason: "subscription operations require `subscribe`".to_string(),
            });
        }
        let request = operation.prepare(&self.schema)?;
        self.execute_query(request).await
    }

    /// Execute an already rendered query request.
    ///
    /// Applies every plugin `pre` hook, posts the payload through the
    /// transport, parses the body into a [`Response`] and applies every
    /// plugin `post` hook.
    pub async fn execute_query(&self, request: Request) -> Result<Response, ClientError> {
        let request = plugin::apply_pre(&self.plugins, request).await;
        let body =
            serde_json::to_string(&request).map_err(|err| ClientError::MalformedRequest {
                reason: err.to_string(),
            })?;
        tracing::debug!("sending request: {body}");
        let response_body = self
            .transport
            .post(body)
            .await
            .map_err(ClientError::Transport)?;
        let response = Response::from_text(&response_body)?;
        Ok(plugin::apply_post(&self.plugins, response).await)
    }

    /// Execute an already rendered mutation request.
    ///
    /// A mutation is carried the same way as a query, so this delegates
    /// without any further changes.
    pub async fn execute_mutation(&self, request: Request) -> Result<Response, ClientError> {
        self.execute_query(request).await
    }

    /// Validate a subscription operation and start streaming its results.
    pub async fn subscribe(
        &self,
        operation: Operation,
        options: crate::json_ext::Object,
    ) -> Result<SubscriptionResponse<T::Connection>, ClientError> {
        if operation.kind != OperationKind::Subscription {
            return Err(ClientError::MalformedRequest {
                reason: "`subscribe` requires a subscription operation".to_string(),
            });
        }
        let request = operation.prepare(&self.schema)?;
        self.execute_subscription(
            SubscriptionRequest::builder()
                .request(request)
                .options(options)
                .build(),
        )
        .await
    }

    /// Initiate a subscription and start listening to messages.
    ///
    /// Opens a duplex connection, performs the connection-init/ack handshake
    /// with the request options as payload, sends the start frame, registers
    /// the subscription for bulk teardown and returns its response stream.
    /// A rejected handshake surfaces before anything is registered.
    pub async fn execute_subscription(
        &self,
        mut request: SubscriptionRequest,
    ) -> Result<SubscriptionResponse<T::Connection>, ClientError> {
        request.request = plugin::apply_pre(&self.plugins, request.request).await;
        let subscription_id = request
            .subscription_id
            .get_or_insert_with(generate_subscription_id)
            .clone();

        let connection = self
            .transport
            .connect(self.protocol)
            .await
            .map_err(ClientError::Transport)?;

        let socket = GraphqlWebSocket::connect(
            connection,
            subscription_id,
            self.protocol,
            Some(Value::Object(request.options.clone())),
        )
        .await?;
        let stream = socket
            .into_subscription(request.request.clone(), Some(self.subscriptions.clone()))
            .await?;

        Ok(SubscriptionResponse { request, stream })
    }
}

/// Generate a unique subscription id.
fn generate_subscription_id() -> String {
    format!("querent:{}", Uuid::new_v4().simple())
}

/// A streaming subscription response.
///
/// Yields one [`Response`] per data frame, in receipt order; a lazy,
/// single-pass sequence that can not be restarted once exhausted.
pub struct SubscriptionResponse<S> {
    request: SubscriptionRequest,
    stream: SubscriptionStream<S>,
}

impl<S> std::fmt::Debug for SubscriptionResponse<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionResponse")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl<S> SubscriptionResponse<S> {
    /// The request this subscription was started from, including its
    /// assigned subscription id.
    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    /// Explicitly end the subscription; safe to call on an ended stream.
    pub fn close(&mut self) {
        self.stream.close();
    }
}

impl<S> Stream for SubscriptionResponse<S>
where
    S: Stream<Item = Result<ServerMessage, SubscriptionError>>
        + Sink<ClientMessage>
        + Unpin
        + Send,
{
    type Item = Result<Response, SubscriptionError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}
