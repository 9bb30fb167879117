use std::{
    convert::Infallible,
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming as IncomingBody},
    header::CONTENT_TYPE,
    Request, Response, StatusCode,
};
use tracing::error;

use crate::{mock::handle_request, GetRequestBody, StubCall, StubRegistry};

/// A handler that can be used by a [Server](crate::Server). If the handler
/// returns an error, the error will be logged and a plain 500 response will
/// be returned to the client.
#[async_trait]
pub trait Handler {
    type Error: Display;
    async fn handle(self, req: Request<IncomingBody>)
        -> Result<Response<Full<Bytes>>, Self::Error>;
}

impl<F, Fut, E> Handler for F
where
    F: FnOnce(Request<IncomingBody>) -> Fut,
    Fut: Future<Output = Result<Response<Full<Bytes>>, E>> + Send + 'static,
    E: Display,
{
    type Error = E;

    fn handle<'async_trait>(
        self,
        req: Request<IncomingBody>,
    ) -> Pin<
        Box<dyn Future<Output = Result<Response<Full<Bytes>>, Self::Error>> + Send + 'async_trait>,
    > {
        Box::pin(self(req))
    }
}

/// Converts a value into a [Result](Result)<T, [Infallible](Infallible)> so it
/// can be used as the return type for a Handler.
///
/// Useful for closures where you can't specify the return type and you don't
/// need to return an error.
pub fn handle_ok<T>(val: T) -> Result<T, Infallible> {
    Ok(val)
}

pub(crate) async fn run_handler<H: Handler>(
    handler: H,
    req: Request<IncomingBody>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match handler.handle(req).await {
        Ok(resp) => Ok(resp),
        Err(err) => {
            error!("Error while handling request: {}", err);
            Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::from(Bytes::from_static(b"Internal Server Error")))
                .expect("should be a valid response"))
        }
    }
}

/// Answers requests from a [StubRegistry] on behalf of a
/// [MockServer](crate::MockServer). Failing to read the request body is the
/// only error; it ends up as a plain 500 through [run_handler].
#[derive(Debug, Clone)]
pub(crate) struct StubHandler {
    pub(crate) registry: Arc<StubRegistry>,
    pub(crate) req_count: Arc<Mutex<u64>>,
}

#[async_trait]
impl Handler for StubHandler {
    type Error = hyper::Error;

    async fn handle(
        self,
        req: Request<IncomingBody>,
    ) -> Result<Response<Full<Bytes>>, Self::Error> {
        let method = req.method().to_string();
        let url = req
            .uri()
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str())
            .to_string();
        let headers = req.headers().clone();
        let body = req.body_bytes().await?;

        let response = handle_request(
            &self.registry,
            StubCall {
                method,
                url,
                headers,
                body,
            },
        );
        *self.req_count.lock().expect("lock poisoned") += 1;
        Ok(response.into_response())
    }
}
