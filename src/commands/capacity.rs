use anyhow::Result;
use std::sync::Arc;

use crate::context::AppContext;

/// Command to print this node's encode capacity
pub struct CapacityCommand {
    ctx: Arc<AppContext>,
}

impl CapacityCommand {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self) -> Result<()> {
        let report = self.ctx.coordinator().capacity_report().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
