use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use crate::context::AppContext;
use crate::server;

/// Command to run the peer and dashboard HTTP API
pub struct ServeCommand {
    ctx: Arc<AppContext>,
    listen: Option<String>,
}

impl ServeCommand {
    pub fn new(ctx: Arc<AppContext>, listen: Option<String>) -> Self {
        Self { ctx, listen }
    }

    pub async fn execute(&self) -> Result<()> {
        self.ctx.store().init().await?;

        let addr = self
            .listen
            .clone()
            .unwrap_or_else(|| self.ctx.config.listen_addr.clone());
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;

        info!(
            "✅ Node {} listening on {} (cluster {})",
            self.ctx.config.node_name,
            listener.local_addr()?,
            if self.ctx.config.cluster_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        info!("Staging directory: {:?}", self.ctx.config.staging_dir);

        axum::serve(listener, server::router(self.ctx.clone()))
            .with_graceful_shutdown(async {
                let _ = signal::ctrl_c().await;
                info!("🛑 Shutdown signal received. Exiting gracefully.");
            })
            .await
            .context("HTTP server failed")?;
        Ok(())
    }
}
