use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{
    body::{self, Body, Bytes},
    server::conn::http1,
    service::service_fn,
    Request, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, select, sync::watch, task::JoinHandle};
use tracing::{debug, error};

use crate::{run_handler, Error, Handler};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A bound HTTP/1.1 listener running a [Handler] for every request.
///
/// This is the transport underneath [MockServer](crate::MockServer). It can
/// also be used on its own when a test needs full control over responses.
///
/// Dropping the server signals the accept loop and all open connections to
/// stop in the background. Use [close](Server::close) to wait until the
/// listening socket has actually been released.
#[derive(Debug)]
pub struct Server {
    close_tx: watch::Sender<bool>,
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Binds a TCP listener to `addr` and starts serving `handler` on it. A
    /// port of 0 picks any free port; the chosen address is returned by
    /// [addr](Server::addr).
    pub async fn bind<H: Handler + Clone + Send + Sync + 'static>(
        addr: SocketAddr,
        handler: H,
    ) -> Result<Self, Error> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let addr = tcp_listener
            .local_addr()
            .map_err(Error::GetTCPListenerAddress)?;

        let (close_tx, close_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(tcp_listener, handler, close_rx));

        Ok(Self {
            close_tx,
            addr,
            accept_task,
        })
    }

    /// Returns the socket address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns a valid request URL for the given path and query string.
    pub fn url(&self, path_and_query: &str) -> Uri {
        build_url(self.addr, path_and_query)
    }

    /// Stops accepting connections, aborts all pending requests and waits for
    /// the listening socket to be closed.
    pub async fn close(mut self) -> Result<(), Error> {
        self.close_tx.send_replace(true);
        (&mut self.accept_task).await.map_err(Error::Close)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
    }
}

pub(crate) fn build_url(addr: SocketAddr, path_and_query: &str) -> Uri {
    Uri::builder()
        .scheme("http")
        .authority(addr.to_string().as_str())
        .path_and_query(path_and_query)
        .build()
        .expect("should be a valid URL")
}

// Runs until the close signal arrives. Accept errors are logged and skipped.
async fn accept_loop<H: Handler + Clone + Send + Sync + 'static>(
    tcp_listener: TcpListener,
    handler: H,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let (tcp_stream, peer) = select! {
            _ = close_rx.changed() => {
                return;
            }
            res = tcp_listener.accept() => {
                match res {
                    Ok(res) => res,
                    Err(err) => {
                        error!("Error while accepting TCP connection: {}", err);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }
        };
        debug!("Accepted connection from {}", peer);

        let handler = handler.clone();
        let mut close_rx = close_rx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<body::Incoming>| {
                run_handler(handler.clone(), req)
            });

            let res = select! {
                _ = close_rx.changed() => {
                    return;
                }
                res = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(tcp_stream), service) => res,
            };

            if let Err(http_err) = res {
                error!("Error while serving HTTP connection from {}: {}", peer, http_err);
            }
        });
    }
}

/// A handy extension to [hyper::Request](hyper::Request) that allows for easily
/// reading the request body as a single `Bytes` object.
#[async_trait]
pub trait GetRequestBody {
    async fn body_bytes(self) -> Result<Bytes, hyper::Error>;
}

#[async_trait]
impl<B> GetRequestBody for Request<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    <B as Body>::Error: Into<hyper::Error>,
{
    async fn body_bytes(self) -> Result<Bytes, hyper::Error> {
        self.into_body()
            .collect()
            .await
            .map(|full| full.to_bytes())
            .map_err(|err| err.into())
    }
}
