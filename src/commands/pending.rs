use anyhow::Result;
use std::sync::Arc;

use crate::context::AppContext;
use crate::state::keys;

/// Command to list items that still need a real title
pub struct PendingCommand {
    ctx: Arc<AppContext>,
}

impl PendingCommand {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self) -> Result<()> {
        let pending = self.ctx.store().pending_identification().await?;
        if pending.is_empty() {
            println!("✅ Nothing waiting for identification.");
            return Ok(());
        }

        println!("\n🏷️  Waiting for identification ({}):", pending.len());
        for item in &pending {
            let year = item
                .metadata
                .text(keys::YEAR)
                .unwrap_or_else(|| "no year".to_string());
            println!("{:>16}  {} [{}]", item.state.to_string(), item.state_file, year);
        }
        Ok(())
    }
}
