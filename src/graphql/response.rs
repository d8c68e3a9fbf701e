use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::error::ClientError;
use crate::graphql::Error;
use crate::json_ext::Object;

/// A GraphQL response.
///
/// Subscription data frames deserialize into the same shape, one instance per
/// streamed event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        extensions: Map<ByteString, Value>,
    ) -> Self {
        Self {
            data,
            errors,
            extensions,
        }
    }

    /// Parse a [`Response`] from a raw response body.
    ///
    /// This will return an error if the input is not a valid GraphQL response
    /// document.
    pub fn from_text(body: &str) -> Result<Response, ClientError> {
        let value: Value =
            serde_json::from_str(body).map_err(|err| ClientError::MalformedResponse {
                reason: err.to_string(),
            })?;
        Self::from_value(value)
    }

    /// Parse a [`Response`] from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Response, ClientError> {
        let response: Response =
            serde_json_bytes::from_value(value).map_err(|err| ClientError::MalformedResponse {
                reason: err.to_string(),
            })?;
        // Graphql spec says:
        // If the data entry in the response is not present, the errors entry
        // in the response must not be empty.
        if response.data.is_none() && response.errors.is_empty() {
            return Err(ClientError::MalformedResponse {
                reason: "graphql response without data must contain at least one error".to_string(),
            });
        }
        Ok(response)
    }

    /// True if the response carries no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
