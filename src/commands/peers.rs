use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

use crate::context::AppContext;

/// Command to query every configured peer
pub struct PeersCommand {
    ctx: Arc<AppContext>,
}

impl PeersCommand {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self) -> Result<()> {
        if !self.ctx.config.cluster_enabled {
            warn!("⚠️  Cluster mode is not enabled on this node");
        }
        if self.ctx.config.peers.is_empty() {
            println!("No peers configured.");
            return Ok(());
        }

        println!("\n🌐 Peers of {}", self.ctx.config.node_name);
        for peer in self.ctx.coordinator().peer_statuses().await {
            match &peer.capacity {
                Some(c) => println!(
                    "   • {} ({}:{}) online, {} of {} slots free, load {:.2}/{:.2}{}",
                    peer.name,
                    peer.host,
                    peer.port,
                    c.slots_free,
                    c.slots_total,
                    c.load_1m,
                    c.max_load,
                    if c.available { "" } else { " [busy]" }
                ),
                None => println!("   • {} ({}:{}) offline", peer.name, peer.host, peer.port),
            }
        }
        Ok(())
    }
}
