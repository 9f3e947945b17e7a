pub mod cluster;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod locks;
pub mod process;
pub mod server;
pub mod state;
pub mod supervisor;

pub use context::AppContext;
pub use error::{PipelineError, PipelineResult};
