//! The sync backend: a small HTTP server holding one versioned state
//! document per account, with optimistic-concurrency writes.

mod auth;
mod routes;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub use auth::{extract_token, AuthError, AuthService, SESSION_COOKIE};
pub use routes::build_router;
use store::StateStore;

/// Server state shared across requests.
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub auth: AuthService,
    /// Name of the session cookie set on login and checked on requests.
    pub session_cookie: String,
    /// Process start, for the health probe's uptime field.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn StateStore>, auth: AuthService) -> Self {
        Self {
            store,
            auth,
            session_cookie: SESSION_COOKIE.to_string(),
            started_at: Instant::now(),
        }
    }

    /// Override the session cookie name.
    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = name.into();
        self
    }
}

/// Handle for managing the server lifecycle.
pub struct ServerHandle {
    /// Address the server is listening on.
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ServerHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the server gracefully.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Bind and start serving in a background task.
pub async fn start_server(listen: &str, state: Arc<AppState>) -> std::io::Result<ServerHandle> {
    let app = build_router(state);
    let listener = TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;

    log::info!("Sync server listening on http://{}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                log::info!("Sync server shutting down");
            })
            .await
            .ok();
    });

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
    })
}
