use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::EngineError;

/// A running HTTP server that can be stopped from the outside.
pub struct ServerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bind `addr` and start serving `router` on a background task.
    pub async fn start(router: Router, addr: SocketAddr) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!("HTTP server failed: {}", e);
            }
            flag.store(false, Ordering::SeqCst);
        });

        tracing::info!(addr = %local_addr, "HTTP server listening");
        Ok(Self {
            local_addr,
            running,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    /// The bound address; differs from the requested one when port 0 was used.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting connections, let in-flight requests finish, and wait
    /// for the server task to exit. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("HTTP server task failed: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("HTTP server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
