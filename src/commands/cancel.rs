use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::supervisor::Outcome;

/// Command to cancel one queue item and revert what its worker left behind
pub struct CancelCommand {
    ctx: Arc<AppContext>,
    state_file: String,
    delete_files: bool,
}

impl CancelCommand {
    pub fn new(ctx: Arc<AppContext>, state_file: String, delete_files: bool) -> Self {
        Self {
            ctx,
            state_file,
            delete_files,
        }
    }

    pub async fn execute(&self) -> Result<()> {
        info!("🗑️ Cancelling {}", self.state_file);
        let report = self
            .ctx
            .supervisor()
            .cancel_queue_item(&self.state_file, self.delete_files)
            .await?;

        for step in &report.steps {
            match step.outcome {
                Outcome::Done => info!("✅ {}", step.detail),
                Outcome::Skipped => info!("⏭️  {}", step.detail),
                Outcome::Failed => warn!("❌ {}", step.detail),
            }
        }
        println!("{}", report.summary());
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
    async fn test_cancel_waiting_item_with_files() {
        let temp_dir = TempDir::new().unwrap();
        let iso = temp_dir.path().join("M.iso");
        std::fs::write(&iso, "iso").unwrap();
        std::fs::write(
            temp_dir.path().join("M-1.image-ready"),
            format!(r#"{{"iso_path":"{}"}}"#, iso.display()),
        )
        .unwrap();

        CancelCommand::new(context(&temp_dir), "M-1.image-ready".to_string(), true)
            .execute()
            .await
            .unwrap();
        assert!(!iso.exists());
        assert!(!temp_dir.path().join("M-1.image-ready").exists());
    }

    #[tokio::test]
    async fn test_cancel_final_stage_fails() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("M-1.archived"), "{}").unwrap();

        let result = CancelCommand::new(context(&temp_dir), "M-1.archived".to_string(), false)
            .execute()
            .await;
        assert!(result.is_err());
        assert!(temp_dir.path().join("M-1.archived").exists());
    }
}
