use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::context::AppContext;

/// Command to report the outcome of a received job back to its origin node
pub struct NotifyOriginCommand {
    ctx: Arc<AppContext>,
    state_file: String,
    success: bool,
    result_path: Option<String>,
}

impl NotifyOriginCommand {
    pub fn new(
        ctx: Arc<AppContext>,
        state_file: String,
        success: bool,
        result_path: Option<String>,
    ) -> Self {
        Self {
            ctx,
            state_file,
            success,
            result_path,
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let response = self
            .ctx
            .coordinator()
            .notify_origin(&self.state_file, self.success, self.result_path.clone())
            .await?;
        info!("📣 Origin answered: {}", response.message);
        if let Some(state_file) = response.state_file {
            println!("{state_file}");
        }
        Ok(())
    }
}
