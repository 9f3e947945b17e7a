use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::supervisor::Outcome;

/// Command to give an item its real title and year
pub struct RenameCommand {
    ctx: Arc<AppContext>,
    state_file: String,
    title: String,
    year: Option<String>,
}

impl RenameCommand {
    pub fn new(ctx: Arc<AppContext>, state_file: String, title: String, year: Option<String>) -> Self {
        Self {
            ctx,
            state_file,
            title,
            year,
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let store = self.ctx.store();
        let record = store.open(&self.state_file).await?;
        let renamed = store
            .rename_item(&record, &self.title, self.year.as_deref())
            .await?;

        for step in &renamed.report.steps {
            match step.outcome {
                Outcome::Done => info!("✅ {}", step.detail),
                Outcome::Skipped => info!("⏭️  {}", step.detail),
                Outcome::Failed => warn!("❌ {}", step.detail),
            }
        }
        println!("{}", renamed.state_file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticLoad;
    use crate::config::Config;
    use crate::process::InMemoryProcessTable;
    use tempfile::TempDir;

    fn context(temp_dir: &TempDir) -> Arc<AppContext> {
        let config = Config {
            staging_dir: temp_dir.path().to_path_buf(),
            lock_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        Arc::new(AppContext::with_parts(
            config,
            Arc::new(InMemoryProcessTable::new()),
            Arc::new(StaticLoad::idle(1)),
        ))
    }

    #[tokio::test]
    async fn test_rename_transferred_item() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("DISC1-1700000000.transferred"),
            r#"{"title":"DISC1","nas_path":"/volume1/Movies/DISC1.mkv"}"#,
        )
        .unwrap();

        RenameCommand::new(
            context(&temp_dir),
            "DISC1-1700000000.transferred".to_string(),
            "Alien".to_string(),
            Some("1979".to_string()),
        )
        .execute()
        .await
        .unwrap();

        assert!(!temp_dir.path().join("DISC1-1700000000.transferred").exists());
        let content =
            std::fs::read_to_string(temp_dir.path().join("Alien-1700000000.transferred")).unwrap();
        assert!(content.contains("\"original_title\": \"DISC1\""), "{content}");
    }
}
