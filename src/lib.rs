//! A schema-aware GraphQL client.
//!
//! Given a server's introspected schema, callers compose field selections
//! programmatically, validate them against the schema before anything hits
//! the network, render GraphQL documents and execute them over a pluggable
//! transport — including multiplexed subscription streaming over the
//! graphql-ws and subscriptions-transport-ws protocols.
//!
//! The building blocks, leaves first:
//!
//! * [`schema::Schema`] — the parsed introspection type graph, the validation
//!   context threaded through everything downstream.
//! * [`selection::Fields`] — schema-free structural composition of selection
//!   trees, deduplicated by field identity.
//! * [`prepare::PreparedFields`] — the validated, renderable form of a
//!   selection, built once per execution.
//! * [`operation::Operation`] — a root-field invocation rendered into a
//!   query/mutation/subscription document.
//! * [`protocols::websocket`] — the subscription handshake-and-streaming
//!   state machine over a duplex message transport.
//! * [`Client`] — the facade wiring schema, transport, plugins and the
//!   subscription registry together.

#![warn(unreachable_pub)]

pub mod error;
pub mod graphql;
pub mod json_ext;
pub mod operation;
pub mod plugin;
pub mod prepare;
pub mod protocols;
pub mod schema;
pub mod selection;

mod client;

pub use client::Client;
pub use client::SubscriptionResponse;
pub use client::Transport;
pub use error::ClientError;
pub use graphql::Request;
pub use graphql::Response;
pub use graphql::SubscriptionRequest;
pub use operation::Operation;
pub use operation::OperationKind;
pub use schema::Schema;
pub use selection::Directive;
pub use selection::Field;
pub use selection::Fields;
pub use selection::Selection;
