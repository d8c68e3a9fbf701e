use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::json_ext::JsonMap;
use crate::json_ext::Object;
use crate::json_ext::deserialize_null_default;

/// A GraphQL request as sent to a server.
///
/// Serializes to exactly the wire payload `{"query", "operationName",
/// "variables"}`; the execution context fields never leave the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Request {
    /// The GraphQL operation (e.g., query, mutation) string.
    ///
    /// For historical purposes, the term "query" is commonly used to refer to
    /// *any* GraphQL operation which might be, e.g., a `mutation`.
    #[serde(default)]
    pub query: Option<String>,

    /// The (optional) GraphQL operation name.
    ///
    /// When specified, this name must match the name of an operation in the
    /// GraphQL document.  When excluded, there must exist only a single
    /// operation in the GraphQL document.
    #[serde(default)]
    pub operation_name: Option<String>,

    /// The (optional) GraphQL variables in the form of a JSON object.
    ///
    /// When specified, these variables can be referred to in the `query` by
    /// using `$variableName` syntax, where `{"variableName": "value"}` has
    /// been specified as this `variables` value.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub variables: Object,

    /// Caller-side execution context, threaded through plugins but never
    /// serialized onto the wire.
    #[serde(skip)]
    pub context: Value,

    /// Caller-side root value, threaded through plugins but never serialized
    /// onto the wire.
    #[serde(skip)]
    pub root: Value,
}

#[buildstructor::buildstructor]
impl Request {
    /// This is the constructor (or builder) to use when constructing a GraphQL
    /// `Request`.
    ///
    /// The optionality of parameters on this constructor match the runtime
    /// requirements which are necessary to create a valid GraphQL `Request`.
    #[builder(visibility = "pub")]
    fn new(
        query: Option<String>,
        operation_name: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        variables: JsonMap<ByteString, Value>,
        context: Option<Value>,
        root: Option<Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
            context: context.unwrap_or_default(),
            root: root.unwrap_or_default(),
        }
    }
}

/// A GraphQL subscription request.
///
/// Carries the underlying [`Request`] plus the connection-level payload sent
/// at handshake time and the subscription correlation id.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct SubscriptionRequest {
    /// The request whose rendered document is sent in the start frame.
    pub request: Request,

    /// Correlation key for all frames of this subscription.
    ///
    /// Generated on execution if absent; must be unique among concurrently
    /// open subscriptions on the same connection.
    pub subscription_id: Option<String>,

    /// Connection-level payload sent with `connection_init`, e.g. auth
    /// headers the server expects at handshake time.
    pub options: Object,
}

#[buildstructor::buildstructor]
impl SubscriptionRequest {
    /// Returns a builder that builds a GraphQL [`SubscriptionRequest`].
    #[builder(visibility = "pub")]
    fn new(
        request: Request,
        subscription_id: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        options: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            request,
            subscription_id,
            options,
        }
    }
}
