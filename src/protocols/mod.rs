//! Wire protocols spoken with GraphQL servers.

pub mod websocket;
