use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::context::AppContext;

/// Command to kill a runaway pipeline worker and clean up after it
pub struct KillCommand {
    ctx: Arc<AppContext>,
    pid: u32,
}

impl KillCommand {
    pub fn new(ctx: Arc<AppContext>, pid: u32) -> Self {
        Self { ctx, pid }
    }

    pub async fn execute(&self) -> Result<()> {
        let outcome = self.ctx.supervisor().kill_with_cleanup(self.pid).await?;
        info!("🛑 Stopped {} worker {}", outcome.kind.as_str(), outcome.pid);
        println!("{}", outcome.message());
        Ok(())
    }
}
