//! Request/response mutation hooks applied around every unary execution.

use async_trait::async_trait;

use crate::graphql::Request;
use crate::graphql::Response;

/// A pre/post hook pair around request execution.
///
/// Both hooks default to the identity. `pre` hooks run left-to-right before
/// the request is sent, `post` hooks left-to-right after the response is
/// received, each threading the possibly-mutated value into the next.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Override to make changes to the request before it is sent.
    async fn pre(&self, request: Request) -> Request {
        request
    }

    /// Override to update the response when the result is in.
    async fn post(&self, response: Response) -> Response {
        response
    }
}

pub(crate) async fn apply_pre(plugins: &[Box<dyn Plugin>], mut request: Request) -> Request {
    for plugin in plugins {
        request = plugin.pre(request).await;
    }
    request
}

pub(crate) async fn apply_post(plugins: &[Box<dyn Plugin>], mut response: Response) -> Response {
    for plugin in plugins {
        response = plugin.post(response).await;
    }
    response
}
