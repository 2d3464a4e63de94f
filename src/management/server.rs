//! Management API Server

use super::{api::ManagementApi, handlers::AppState, types::ApiAuthConfig};
use crate::controller::PacketHolder;
use crate::Result;
use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// HTTP control surface for a `PacketHolder`
pub struct ManagementServer {
    bind_addr: SocketAddr,
    app_state: AppState,
    auth_config: ApiAuthConfig,
}

impl ManagementServer {
    pub fn new(bind_addr: SocketAddr, app_state: AppState, auth_config: ApiAuthConfig) -> Self {
        Self {
            bind_addr,
            app_state,
            auth_config,
        }
    }

    pub fn holder(&self) -> &PacketHolder {
        &self.app_state.holder
    }

    /// Serve the API until `shutdown` fires
    pub async fn start(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind management API server to {}", self.bind_addr))?;

        info!("Management API server listening on {}", self.bind_addr);

        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });
        if let Err(e) = serve.await {
            error!("Management API server error: {}", e);
            return Err(e.into());
        }

        info!("Management API server stopped");
        Ok(())
    }

    pub fn router(&self) -> Router {
        ManagementApi::create_router(self.app_state.clone(), self.auth_config.clone())
    }
}
