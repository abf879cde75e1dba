//! TCP accept loop serving a [`Dispatcher`] over HTTP/1 and HTTP/2.

use std::{convert::Infallible, future::Future, io, net::SocketAddr, time::Duration};

use axum::{body::Body, extract::ConnectInfo, http::Request};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Server {
    dispatcher: Dispatcher,
}

impl Server {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Accepts connections until the process exits.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accepts connections until `signal` resolves. Connections already
    /// accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");

        tokio::pin!(signal);
        loop {
            let accepted = tokio::select! {
                () = &mut signal => {
                    info!(%local_addr, "shutdown signal received, no longer accepting");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(serve_connection(dispatcher, stream, remote_addr));
                }
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

async fn serve_connection(dispatcher: Dispatcher, stream: TcpStream, remote_addr: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%remote_addr, error = %err, "cannot set TCP_NODELAY");
    }

    let service = service_fn(move |request: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        async move {
            let mut request = request.map(Body::new);
            request.extensions_mut().insert(ConnectInfo(remote_addr));
            Ok::<_, Infallible>(dispatcher.dispatch(request).await)
        }
    });

    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(%remote_addr, error = %err, "connection closed with error");
    }
}
