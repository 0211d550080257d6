//! Bundled static file server used when a project has no serve command.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::error::ServerError;

/// A running static file server bound to one directory.
#[derive(Debug)]
pub struct FallbackServer {
    addr: SocketAddr,
    handle: ServerHandle,
}

impl FallbackServer {
    /// Bind `0.0.0.0:port` and serve `directory`, `index.html` as the
    /// directory default. Port `0` picks a free port.
    ///
    /// The server task stops when [`ServerHandle::close`] is called or when
    /// every handle has been dropped.
    pub async fn start(port: u16, directory: &Path) -> Result<Self, ServerError> {
        if !directory.is_dir() {
            tracing::warn!(
                directory = %directory.display(),
                "serve directory does not exist yet; requests will 404",
            );
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .fallback_service(ServeDir::new(directory).append_index_html_on_directories(true))
            .layer(TraceLayer::new_for_http());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(async move {
            let shutdown = async move {
                // Also resolves when every handle is gone.
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %err, "fallback server stopped with error");
            }
            let _ = closed_tx.send(true);
        });

        // The "listening" event: the socket is bound and accepting.
        tracing::info!(
            directory = %directory.display(),
            "serving from http://localhost:{} started",
            addr.port(),
        );

        Ok(Self {
            addr,
            handle: ServerHandle {
                addr,
                shutdown: Arc::new(shutdown_tx),
                closed: closed_rx,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// A cloneable closer for the termination path.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub async fn close(&self) {
        self.handle.close().await;
    }
}

/// Cloneable handle that closes a [`FallbackServer`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, wait for the server task to finish. Idempotent.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let mut closed = self.closed.clone();
        // Err means the task is already gone; nothing left to wait for.
        let _ = closed.wait_for(|done| *done).await;
        tracing::debug!(addr = %self.addr, "fallback server closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn http_get(addr: SocketAddr, path: &str) -> Result<ureq::Response, ureq::Error> {
        ureq::get(&format!("http://127.0.0.1:{}{path}", addr.port())).call()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_index_html_by_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hello kiln</h1>").unwrap();

        let server = FallbackServer::start(0, dir.path()).await.unwrap();
        let addr = server.local_addr();
        let response = tokio::task::spawn_blocking(move || http_get(addr, "/"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.into_string().unwrap().contains("hello kiln"));

        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let server = FallbackServer::start(0, dir.path()).await.unwrap();
        let addr = server.local_addr();

        let result = tokio::task::spawn_blocking(move || http_get(addr, "/nope.txt"))
            .await
            .unwrap();
        assert!(matches!(result, Err(ureq::Error::Status(404, _))));
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_and_stops_listening() {
        let dir = TempDir::new().unwrap();
        let server = FallbackServer::start(0, dir.path()).await.unwrap();
        let handle = server.handle();
        let addr = server.local_addr();

        handle.close().await;
        handle.close().await;
        server.close().await;
        assert!(handle.is_closed());

        let result = tokio::task::spawn_blocking(move || http_get(addr, "/"))
            .await
            .unwrap();
        assert!(
            matches!(result, Err(ureq::Error::Transport(_))),
            "server should no longer accept connections"
        );
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let dir = TempDir::new().unwrap();
        let first = FallbackServer::start(0, dir.path()).await.unwrap();
        let port = first.local_addr().port();

        let err = FallbackServer::start(port, dir.path()).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.close().await;
    }
}
