use anyhow::Result;
use std::sync::Arc;

use crate::context::AppContext;
use crate::state::{keys, QUEUE_ITEMS_PER_PAGE};

/// Command to list every record, newest first
pub struct QueueCommand {
    ctx: Arc<AppContext>,
    page: Option<usize>,
}

impl QueueCommand {
    pub fn new(ctx: Arc<AppContext>, page: Option<usize>) -> Self {
        Self { ctx, page }
    }

    pub async fn execute(&self) -> Result<()> {
        let page = self
            .ctx
            .store()
            .queue_items(self.page, QUEUE_ITEMS_PER_PAGE)
            .await?;

        if page.total == 0 {
            println!("📭 Queue is empty.");
            return Ok(());
        }

        println!(
            "\n📋 Queue ({} items, page {}/{})",
            page.total, page.page, page.total_pages
        );
        for item in &page.items {
            let remote = if item.metadata.flag(keys::IS_REMOTE_JOB) {
                format!(
                    " (from {})",
                    item.metadata
                        .text(keys::ORIGIN_NODE)
                        .unwrap_or_else(|| "peer".to_string())
                )
            } else {
                String::new()
            };
            println!("{:>16}  {}{}", item.state.to_string(), item.file, remote);
        }
        Ok(())
    }
}
