//! An in-process mock HTTP API for tests. Register canned responses
//! ("stubs") for exact method and path combinations, or for regular
//! expression paths with a priority, and point the client under test at the
//! server.
//!
//! Routes are resolved in a fixed order. An exact `METHOD PATH` route always
//! wins. Otherwise pattern routes are tried from priority 100 down to 0,
//! and within one priority in the order they were registered. A request no
//! stub matches is answered with a 500 and the body
//! `The requested route has not been declared.`
//!
//! Currently only supports HTTP/1.1 and does not support TLS. Only supports the
//! Tokio async runtime.
//!
//! ## Example
//!
//! ```
//! use mock_api_server::{MockServer, StubReturn};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let server = MockServer::new(0);
//! server.start().await.expect("start server");
//!
//! server.stub("PUT", "/sf").expect("stub route").returns(420);
//! server
//!     .stub("GET", regex::Regex::new("^/users/[0-9]+$").unwrap())
//!     .expect("stub pattern")
//!     .returns(StubReturn::json(json!({"name": "ada"})));
//!
//! let res = reqwest::Client::new()
//!     .put(server.url("/sf").to_string())
//!     .send()
//!     .await
//!     .expect("send request");
//! assert_eq!(res.status(), 420);
//!
//! let res = reqwest::get(server.url("/users/7").to_string())
//!     .await
//!     .expect("send request");
//! assert_eq!(res.text().await.expect("read response"), r#"{"name":"ada"}"#);
//!
//! let stub = server.get_stub("PUT", "/sf").expect("stub exists");
//! assert!(stub.called_once());
//!
//! server.stop().await.expect("stop server");
//! # });
//! ```
//!
//! There are also more examples as tests.

mod error;
mod handler;
mod mock;
mod registry;
mod response;
mod server;
mod stub;

pub use error::Error;
pub use handler::*;
pub use mock::{MockServer, ServerState};
pub use registry::{IntoRoutePath, Pattern, RoutePath, StubRegistry, PRIORITY_DEFAULT, PRIORITY_LIMIT};
pub use response::{ContentType, ResponseDescriptor, NOT_DECLARED_BODY, STUB_FAILED_BODY};
pub use server::{GetRequestBody, Server};
pub use stub::{Stub, StubCall, StubReturn, StubRoute};

pub use hyper;
