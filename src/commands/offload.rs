use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::context::AppContext;

/// Command to hand a queued image to a peer whose staging already holds it
pub struct OffloadCommand {
    ctx: Arc<AppContext>,
    state_file: String,
    peer: Option<String>,
}

impl OffloadCommand {
    pub fn new(ctx: Arc<AppContext>, state_file: String, peer: Option<String>) -> Self {
        Self {
            ctx,
            state_file,
            peer,
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let handoff = self
            .ctx
            .coordinator()
            .hand_off(&self.state_file, self.peer.as_deref())
            .await?;
        info!(
            "📤 {} accepted {} at queue position {}",
            handoff.peer, handoff.remote_state_file, handoff.queue_position
        );
        println!("{}", handoff.state_file);
        Ok(())
    }
}
