use anyhow::Result;
use std::sync::Arc;

use crate::context::AppContext;
use crate::locks::{LockFamily, LockId, LockRegistry};
use crate::process;

/// Command to print stage counts, lock holders and running workers
pub struct StatusCommand {
    ctx: Arc<AppContext>,
}

impl StatusCommand {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self) -> Result<()> {
        let counts = self.ctx.store().count_by_stage().await?;

        println!("\n📊 Pipeline status on {}", self.ctx.config.node_name);
        println!("─────────────────────────");
        for (stage, count) in &counts {
            println!("{stage:>16}: {count}");
        }

        println!("\n🔒 Locks:");
        for line in lock_lines(&self.ctx.locks()) {
            println!("   {line}");
        }

        let processes =
            process::scan_processes(self.ctx.processes.clone(), |table| table.pipeline_processes())
                .await;
        println!("\n⚙️  Workers: {}", processes.len());
        for process in processes {
            println!("   • {} [{}] {}", process.pid, process.kind.as_str(), process.command);
        }
        Ok(())
    }
}

/// One line per family, followed by one line per shard for sharded families
fn lock_lines(locks: &LockRegistry) -> Vec<String> {
    let mut lines = Vec::new();
    for family in LockFamily::ALL {
        if !family.is_sharded() {
            let lock = LockId::singleton(family);
            lines.push(format!("• {family}: {}", describe_lock(locks, &lock)));
            continue;
        }

        let shards = locks.family_locks(family);
        let held = shards.iter().filter(|lock| locks.check(lock).active).count();
        if held == 0 {
            lines.push(format!("• {family}: free"));
        } else {
            lines.push(format!("• {family}: {held} of {} shards held", shards.len()));
        }
        for lock in &shards {
            lines.push(format!("    {}: {}", lock.shard_label(), describe_lock(locks, lock)));
        }
    }
    lines
}

fn describe_lock(locks: &LockRegistry, lock: &LockId) -> String {
    let status = locks.check(lock);
    match (status.pid.filter(|_| status.active), locks.recorded_pid(lock)) {
        (Some(pid), _) => format!("held by PID {pid}"),
        (None, Some(pid)) => format!("stale (PID {pid} is gone)"),
        (None, None) => "free".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticLoad;
    use crate::config::Config;
    use crate::process::InMemoryProcessTable;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_on_missing_staging_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            staging_dir: temp_dir.path().join("missing"),
            lock_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        let ctx = AppContext::with_parts(
            config,
            Arc::new(InMemoryProcessTable::new()),
            Arc::new(StaticLoad::idle(1)),
        );
        assert!(StatusCommand::new(Arc::new(ctx)).execute().await.is_ok());
    }

    #[test]
    fn test_lock_lines_show_held_shards_and_stale_singletons() {
        let temp_dir = TempDir::new().unwrap();
        let table = Arc::new(InMemoryProcessTable::new());
        table.spawn(4242, "HandBrakeCLI -i Heat.iso");
        fs::write(temp_dir.path().join("encoder-1.lock"), "4242").unwrap();
        fs::write(temp_dir.path().join("encoder-2.lock"), "4343").unwrap();
        fs::write(temp_dir.path().join("archive.lock"), "99").unwrap();
        let registry = LockRegistry::new(temp_dir.path(), table);

        let lines = lock_lines(&registry);

        assert!(lines.contains(&"• encoder: 1 of 2 shards held".to_string()), "{lines:?}");
        assert!(lines.contains(&"    1: held by PID 4242".to_string()), "{lines:?}");
        assert!(lines.contains(&"    2: stale (PID 4343 is gone)".to_string()), "{lines:?}");
        assert!(lines.contains(&"• archive: stale (PID 99 is gone)".to_string()), "{lines:?}");
        assert!(lines.contains(&"• transfer: free".to_string()), "{lines:?}");
        assert!(lines.contains(&"• distribute: free".to_string()), "{lines:?}");
    }
}
