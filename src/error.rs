//! Client errors.
use displaydoc::Display;
use thiserror::Error;

use crate::operation::OperationKind;

/// Type-erased error type used at the transport boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while turning an introspection document into a
/// [`Schema`](crate::schema::Schema).
///
/// These are fatal and never retried: a malformed schema can not be repaired
/// by asking the server again.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum SchemaError {
    /// introspection document declares no types
    NoTypesFound,

    /// introspection document is malformed: {0}
    InvalidDocument(#[from] serde_json::Error),
}

/// Errors raised while validating a selection tree against a schema.
///
/// Raised before any network call is made, so an invalid document is never
/// sent to the server.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// field name must not be empty
    EmptyFieldName,

    /// no field named `{field}` on type `{parent}`
    UnknownField {
        /// Name of the missing field.
        field: String,
        /// The type the field was sought on.
        parent: String,
    },

    /// directive name must not be empty
    EmptyDirectiveName,

    /// no directive named `{directive}` in schema
    UnknownDirective {
        /// Name of the missing directive.
        directive: String,
    },

    /// type `{name}` is not defined in the schema
    UndefinedType {
        /// The unresolved leaf type name.
        name: String,
    },

    /// schema exposes no {0} root operation type
    MissingOperationRoot(OperationKind),
}

/// Errors raised by the subscription protocol engine.
///
/// A connection rejected during the handshake and a protocol violation
/// observed mid-stream are distinct kinds: callers may want different retry
/// policies for each.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum SubscriptionError {
    /// server rejected the connection: {reason}
    ConnectionRejected {
        /// What the server replied instead of an acknowledgment.
        reason: String,
    },

    /// timed out waiting for the server to acknowledge the connection
    AckTimedOut,

    /// subscription protocol violation: {reason}
    Protocol {
        /// The reason the inbound frame was not acceptable.
        reason: String,
    },

    /// websocket transport failure: {0}
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// frame serialization failure: {0}
    Serde(#[from] serde_json::Error),

    /// connection closed before the subscription was established
    ConnectionClosed,
}

/// Top-level error type returned by [`Client`](crate::Client) operations.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// {0}
    Schema(#[from] SchemaError),

    /// {0}
    Validation(#[from] ValidationError),

    /// {0}
    Subscription(#[from] SubscriptionError),

    /// transport failure: {0}
    Transport(BoxError),

    /// request was malformed: {reason}
    MalformedRequest {
        /// The reason the serialization failed.
        reason: String,
    },

    /// response was malformed: {reason}
    MalformedResponse {
        /// The reason the deserialization failed.
        reason: String,
    },
}
