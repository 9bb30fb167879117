use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use hyper::Uri;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    handler::StubHandler, server::build_url, Error, IntoRoutePath, ResponseDescriptor, Server,
    Stub, StubCall, StubRegistry,
};

/// Lifecycle of a [MockServer]. A stopped server can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Starting,
    Listening,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct Lifecycle {
    state: ServerState,
    addr: Option<SocketAddr>,
}

#[derive(Debug)]
struct Inner {
    bind_addr: SocketAddr,
    registry: Arc<StubRegistry>,
    req_count: Arc<Mutex<u64>>,
    lifecycle: Mutex<Lifecycle>,
    listener: tokio::sync::Mutex<Option<Server>>,
}

/// A mock HTTP API whose routes are answered by [Stub]s.
///
/// The server can be cloned and shared between tasks; all clones control the
/// same listener and the same stubs. When the final clone is dropped the
/// listener is shut down in the background.
#[derive(Debug, Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

impl MockServer {
    /// Creates a mock server that will listen on `127.0.0.1:port` once
    /// [started](MockServer::start). Port 0 picks any free port.
    pub fn new(port: u16) -> Self {
        Self::with_addr(([127, 0, 0, 1], port).into())
    }

    pub fn with_addr(bind_addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                bind_addr,
                registry: Arc::new(StubRegistry::new()),
                req_count: Arc::new(Mutex::new(0)),
                lifecycle: Mutex::new(Lifecycle {
                    state: ServerState::Created,
                    addr: None,
                }),
                listener: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Binds the listener. Starting a server that is already listening does
    /// nothing and succeeds.
    pub async fn start(&self) -> Result<(), Error> {
        let mut listener = self.inner.listener.lock().await;
        if let Some(server) = listener.as_ref() {
            debug!("Server already listening ({})", server.addr());
            return Ok(());
        }

        let previous = self.set_state(ServerState::Starting, None);
        let handler = StubHandler {
            registry: self.inner.registry.clone(),
            req_count: self.inner.req_count.clone(),
        };
        match Server::bind(self.inner.bind_addr, handler).await {
            Ok(server) => {
                info!("Server listening ({})", server.addr());
                self.set_state(ServerState::Listening, Some(server.addr()));
                *listener = Some(server);
                Ok(())
            }
            Err(err) => {
                error!("Failed to start server ({}): {}", self.inner.bind_addr, err);
                self.set_state(previous, None);
                Err(err)
            }
        }
    }

    /// Starts the server in the background without waiting for it. A bind
    /// failure is only logged and leaves the state where it was. The returned
    /// handle completes once the attempt is over and may be ignored.
    pub fn spawn_start(&self) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            // The failure has already been logged by start.
            let _ = server.start().await;
        })
    }

    /// Closes the listener and waits until the port is released. Stopping a
    /// server that is not listening does nothing and succeeds.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut listener = self.inner.listener.lock().await;
        let Some(server) = listener.take() else {
            debug!("Server not listening, nothing to stop");
            return Ok(());
        };

        let addr = server.addr();
        self.set_state(ServerState::Stopping, Some(addr));
        let res = server.close().await;
        self.set_state(ServerState::Stopped, None);
        match &res {
            Ok(()) => info!("Server stopped ({})", addr),
            Err(err) => error!("Failed to stop server ({}): {}", addr, err),
        }
        res
    }

    fn set_state(&self, state: ServerState, addr: Option<SocketAddr>) -> ServerState {
        let mut lifecycle = self.inner.lifecycle.lock().expect("lock poisoned");
        lifecycle.addr = addr;
        std::mem::replace(&mut lifecycle.state, state)
    }

    pub fn state(&self) -> ServerState {
        self.inner.lifecycle.lock().expect("lock poisoned").state
    }

    /// Returns the address the server is listening on, or the configured
    /// address while it is not listening.
    pub fn addr(&self) -> SocketAddr {
        self.inner
            .lifecycle
            .lock()
            .expect("lock poisoned")
            .addr
            .unwrap_or(self.inner.bind_addr)
    }

    /// Returns a valid request URL for the given path and query string.
    pub fn url(&self, path_and_query: &str) -> Uri {
        build_url(self.addr(), path_and_query)
    }

    pub fn registry(&self) -> &StubRegistry {
        &self.inner.registry
    }

    /// Returns the stub for `method` and `path`, creating it if needed. See
    /// [StubRegistry::register].
    pub fn stub(&self, method: &str, path: impl IntoRoutePath) -> Result<Stub, Error> {
        self.inner.registry.register(method, path)
    }

    pub fn stub_get(&self, path: impl IntoRoutePath) -> Result<Stub, Error> {
        self.inner.registry.register_get(path)
    }

    pub fn stub_with_priority(
        &self,
        method: &str,
        path: impl IntoRoutePath,
        priority: i64,
    ) -> Result<Stub, Error> {
        self.inner
            .registry
            .register_with_priority(method, path, priority)
    }

    /// Returns the stub a request for `method` and `path` would be answered
    /// by.
    pub fn get_stub(&self, method: &str, path: &str) -> Option<Stub> {
        self.inner.registry.resolve(method, path)
    }

    /// Removes every stub. The listener keeps running.
    pub fn restore(&self) {
        self.inner.registry.reset();
    }

    /// Answers a single request without going through the network.
    pub fn handle_request(&self, call: StubCall) -> ResponseDescriptor {
        handle_request(&self.inner.registry, call)
    }

    /// Returns the number of requests answered over the network since the
    /// server was created. Restoring stubs does not reset it.
    pub fn req_count(&self) -> u64 {
        *self.inner.req_count.lock().expect("lock poisoned")
    }

    /// Await req_count reaching a certain number. This polls every 10ms and
    /// times out after the given duration.
    pub async fn await_req_count(&self, target_count: u64, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            let current_count = self.req_count();
            if current_count == target_count {
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(Error::AwaitReqCountTimeout {
                    current_count,
                    target_count,
                    timeout,
                });
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub(crate) fn handle_request(registry: &StubRegistry, call: StubCall) -> ResponseDescriptor {
    debug!("Request: {} {}", call.method, call.url);

    let response = match registry.resolve(&call.method, &call.url) {
        None => {
            warn!("No stub found: {} {}", call.method, call.url);
            ResponseDescriptor::not_declared()
        }
        Some(stub) => match stub.invoke(call) {
            Ok(result) => ResponseDescriptor::from_stub_return(result),
            Err(err) => {
                warn!("Stub failed: {}", err);
                ResponseDescriptor::stub_failed()
            }
        },
    };

    debug!(
        "Response: {} {} ({})",
        response.status, response.body, response.content_type
    );
    response
}

#[cfg(test)]
mod test {
    use std::net::TcpListener as StdTcpListener;

    use regex::Regex;
    use serde_json::{json, Value};
    use tracing_test::traced_test;

    use super::*;
    use crate::{handle_ok, ContentType, StubReturn, NOT_DECLARED_BODY, STUB_FAILED_BODY};

    async fn started() -> MockServer {
        let server = MockServer::new(0);
        server.start().await.expect("start server");
        server
    }

    fn pattern(source: &str) -> Regex {
        Regex::new(source).expect("valid regex")
    }

    #[tokio::test]
    async fn stub_status_code_and_release_port() {
        let server = started().await;
        assert_eq!(server.state(), ServerState::Listening);
        server.stub("PUT", "/sf").expect("stub").returns(420);

        let res = reqwest::Client::new()
            .put(server.url("/sf").to_string())
            .send()
            .await
            .expect("send request");
        assert_eq!(res.status(), 420);
        assert_eq!(res.text().await.expect("read response"), "response");

        let addr = server.addr();
        server.stop().await.expect("stop server");
        assert_eq!(server.state(), ServerState::Stopped);

        // The port is free again.
        let again = MockServer::with_addr(addr);
        again.start().await.expect("start on the released port");
        assert_eq!(again.addr(), addr);
        again.stop().await.expect("stop server");

        // A stopped server can be restarted on its port.
        again.start().await.expect("restart server");
        assert_eq!(again.state(), ServerState::Listening);
        again.stop().await.expect("stop server");
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let server = MockServer::new(0);
        assert_eq!(server.state(), ServerState::Created);
        server.stop().await.expect("stop before start");
        assert_eq!(server.state(), ServerState::Created);

        server.start().await.expect("start server");
        let addr = server.addr();
        server.start().await.expect("second start");
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.addr(), addr);

        server.stop().await.expect("stop server");
        server.stop().await.expect("second stop");
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn start_reports_bind_failure() {
        let taken = StdTcpListener::bind("127.0.0.1:0").expect("bind std listener");
        let addr = taken.local_addr().expect("local addr");

        let server = MockServer::with_addr(addr);
        let err = server.start().await.expect_err("port is taken");
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(server.state(), ServerState::Created);

        drop(taken);
        server.start().await.expect("start once the port is free");
    }

    #[tokio::test]
    async fn spawn_start_on_taken_port() {
        let taken = StdTcpListener::bind("127.0.0.1:0").expect("bind std listener");
        let addr = taken.local_addr().expect("local addr");

        let server = MockServer::with_addr(addr);
        server.spawn_start().await.expect("join start task");
        assert_eq!(server.state(), ServerState::Created);

        drop(taken);
        server.spawn_start().await.expect("join start task");
        assert_eq!(server.state(), ServerState::Listening);
        server.stop().await.expect("stop server");
    }

    #[tokio::test]
    async fn spawn_start_without_waiting() {
        let server = MockServer::new(0);
        server.spawn_start();

        let start = Instant::now();
        while server.state() != ServerState::Listening {
            assert!(start.elapsed() < Duration::from_secs(1), "server never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.stub_get("/").expect("stub");
        let res = reqwest::get(server.url("/").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 200);
    }

    #[tokio::test]
    async fn unmatched_route_is_500() {
        let server = started().await;

        let res = reqwest::get(server.url("/nothing/here").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 500);
        assert_eq!(
            res.headers()["content-type"].to_str().expect("header value"),
            "text/plain"
        );
        assert_eq!(res.text().await.expect("read response"), NOT_DECLARED_BODY);
        assert_eq!(server.req_count(), 1);
    }

    #[tokio::test]
    async fn basic_route_records_call() {
        let server = started().await;
        server.stub("GET", "/bent").expect("stub");

        let res = reqwest::Client::new()
            .get(server.url("/bent").to_string())
            .header("x-test", "yes")
            .send()
            .await
            .expect("send request");
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.expect("read response"), "response");

        let stub = server.get_stub("GET", "/bent").expect("stub exists");
        assert!(stub.called_once());
        let call = stub.last_call().expect("recorded call");
        assert_eq!(call.method, "GET");
        assert_eq!(call.url, "/bent");
        assert_eq!(call.headers["x-test"], "yes");
    }

    #[tokio::test]
    async fn stub_get_by_default() {
        let server = started().await;
        server.stub("/shorty", "").expect("stub").returns(302);

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("build client");
        let res = client
            .get(server.url("/shorty").to_string())
            .send()
            .await
            .expect("send request");
        assert_eq!(res.status(), 302);
    }

    #[tokio::test]
    async fn stub_request_body() {
        let server = started().await;
        server.stub("POST", "/sign").expect("stub").returns("SIGN POST");

        let res = reqwest::Client::new()
            .post(server.url("/sign").to_string())
            .body("payload")
            .send()
            .await
            .expect("send request");
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.expect("read response"), "SIGN POST");

        let stub = server.get_stub("POST", "/sign").expect("stub exists");
        assert_eq!(stub.last_call().expect("recorded call").body_text(), "payload");
    }

    #[tokio::test]
    async fn stub_status_and_body() {
        let server = started().await;
        server
            .stub("GET", "/repeat")
            .expect("stub")
            .returns(StubReturn::status_and_body(500, "REPEAT DELETE"));

        let res = reqwest::get(server.url("/repeat").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 500);
        assert_eq!(res.text().await.expect("read response"), "REPEAT DELETE");
    }

    #[tokio::test]
    async fn stub_status_and_json() {
        let server = started().await;
        let body = json!({
            "pity": "thefool",
            "players": ["haters", "haters", "haters"],
        });
        server
            .stub("GET", "/playerhaters")
            .expect("stub")
            .returns(json!({"status": 502, "body": body.clone()}));

        let res = reqwest::get(server.url("/playerhaters").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 502);
        assert_eq!(
            res.headers()["content-type"].to_str().expect("header value"),
            "application/json"
        );
        let got: Value =
            serde_json::from_str(&res.text().await.expect("read response")).expect("json body");
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn regex_routes() {
        let server = started().await;
        server
            .stub("GET", pattern("(?i)[a-z]+"))
            .expect("stub")
            .returns(StubReturn::json(json!({"hello": "world"})));

        let res = reqwest::get(server.url("/aaaa").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.expect("read response"), r#"{"hello":"world"}"#);

        let res = reqwest::get(server.url("/111").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 500);
    }

    #[tokio::test]
    async fn regex_priorities() {
        let server = started().await;
        server
            .stub_with_priority("GET", pattern("[0-9]+"), 0)
            .expect("stub")
            .returns(json!({"status": 200}));
        server
            .stub_with_priority("GET", pattern("(?i)[a-z]+"), 1)
            .expect("stub")
            .returns(json!({"status": 404}));

        let res = reqwest::get(server.url("/aa11").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 404);

        server.restore();
        server
            .stub_with_priority("GET", pattern("[0-9]+"), 1)
            .expect("stub")
            .returns(json!({"status": 200}));
        server
            .stub_with_priority("GET", pattern("(?i)[a-z]+"), 1)
            .expect("stub")
            .returns(json!({"status": 404}));

        let res = reqwest::get(server.url("/aa11").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 200);
    }

    #[tokio::test]
    async fn overwriting_stubs() {
        let server = started().await;
        server
            .stub("GET", "/bent")
            .expect("stub")
            .returns(StubReturn::status_and_body(200, "hello"));
        server
            .stub("GET", "/bent")
            .expect("stub")
            .returns(StubReturn::status_and_body(200, "goodbye"));

        let res = reqwest::get(server.url("/bent").to_string())
            .await
            .expect("send request");
        assert_eq!(res.text().await.expect("read response"), "goodbye");

        server.restore();
        server
            .stub("GET", pattern("bent"))
            .expect("stub")
            .returns(StubReturn::status_and_body(200, "hello"));
        server
            .stub("GET", pattern("bent"))
            .expect("stub")
            .returns(StubReturn::status_and_body(200, "goodbye"));

        let res = reqwest::get(server.url("/bent").to_string())
            .await
            .expect("send request");
        assert_eq!(res.text().await.expect("read response"), "goodbye");
    }

    #[tokio::test]
    async fn restore_clears_routes_but_keeps_listening() {
        let server = started().await;
        server.stub("GET", "/stuff").expect("stub").returns(404);
        server.stub("PUT", "/things").expect("stub").returns(500);
        server.restore();
        assert_eq!(server.state(), ServerState::Listening);

        let res = reqwest::get(server.url("/stuff").to_string())
            .await
            .expect("send request");
        assert_eq!(res.status(), 500);
        assert_eq!(res.text().await.expect("read response"), NOT_DECLARED_BODY);

        let res = reqwest::Client::new()
            .put(server.url("/things").to_string())
            .send()
            .await
            .expect("send request");
        assert_eq!(res.status(), 500);
        assert_eq!(res.text().await.expect("read response"), NOT_DECLARED_BODY);
    }

    #[tokio::test]
    async fn failing_stub_does_not_take_down_server() {
        let server = started().await;
        server
            .stub("GET", "/broken")
            .expect("stub")
            .returns_with(|_| -> Result<StubReturn, String> { panic!("stub exploded") });
        server
            .stub("GET", "/error")
            .expect("stub")
            .returns_with(|_| Err::<StubReturn, _>("no such user"));
        server.stub("GET", "/ok").expect("stub").returns("still here");

        for path in ["/broken", "/error"] {
            let res = reqwest::get(server.url(path).to_string())
                .await
                .expect("send request");
            assert_eq!(res.status(), 500);
            assert_eq!(res.text().await.expect("read response"), STUB_FAILED_BODY);
        }

        let res = reqwest::get(server.url("/ok").to_string())
            .await
            .expect("send request");
        assert_eq!(res.text().await.expect("read response"), "still here");
        assert!(server.get_stub("GET", "/broken").expect("stub").called_once());
    }

    #[tokio::test]
    async fn computed_stub_sees_query_string() {
        let server = started().await;
        server
            .stub("GET", pattern("^/search"))
            .expect("stub")
            .returns_with(|call| handle_ok(call.url.clone()));

        let res = reqwest::get(server.url("/search?q=rust").to_string())
            .await
            .expect("send request");
        assert_eq!(res.text().await.expect("read response"), "/search?q=rust");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_requests_are_all_recorded() {
        let server = started().await;
        let stub = server.stub("GET", "/busy").expect("stub");
        stub.returns(204);

        static ITERATIONS: u64 = 20;
        let url = server.url("/busy").to_string();
        let client = reqwest::Client::new();
        let futures: Vec<tokio::task::JoinHandle<()>> = (0..ITERATIONS)
            .map(|_| {
                let client = client.clone();
                let url = url.clone();

                tokio::spawn(async move {
                    let res = client.get(url).send().await.expect("send request");
                    assert_eq!(res.status(), 204);
                })
            })
            .collect();

        server
            .await_req_count(ITERATIONS, Duration::from_secs(5))
            .await
            .expect("requests finished");

        for fut in futures {
            fut.await.unwrap();
        }
        assert_eq!(stub.call_count() as u64, ITERATIONS);
    }

    #[tokio::test]
    async fn await_req_count_times_out() {
        let server = started().await;
        let err = server
            .await_req_count(1, Duration::from_millis(50))
            .await
            .expect_err("no requests were sent");
        assert!(matches!(
            err,
            Error::AwaitReqCountTimeout {
                current_count: 0,
                target_count: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dropping_server_closes_listener() {
        let server = started().await;
        let url = server.url("/").to_string();
        drop(server);

        // Give the accept loop a moment to notice.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reqwest::get(url).await.is_err());
    }

    #[test]
    #[traced_test]
    fn handle_request_without_network() {
        let server = MockServer::new(0);
        server.stub("PUT", "/sf").expect("stub").returns(420);

        let res = server.handle_request(StubCall::new("put", "/sf"));
        assert_eq!(res.status, 420);
        assert_eq!(res.content_type, ContentType::TextPlain);
        assert!(logs_contain("Response: 420 response (text/plain)"));

        let res = server.handle_request(StubCall::new("GET", "/missing"));
        assert_eq!(res, ResponseDescriptor::not_declared());
        assert!(logs_contain("No stub found: GET /missing"));

        // Calls made without the network are not counted as requests.
        assert_eq!(server.req_count(), 0);
    }
}
