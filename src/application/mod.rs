use anyhow::Result;
use std::sync::Arc;

pub mod command_handlers;
pub mod dependency_container;

pub use command_handlers::{
    BaselineCommandHandler, MonitorCommandHandler, PoolCommandHandler, RunCommandHandler,
    TriageCommandHandler,
};
pub use dependency_container::DependencyContainer;

use crate::config::DiagnosticsConfig;

/// Application layer - wires the engine together for the command line
pub struct Application {
    pub container: Arc<DependencyContainer>,
}

impl Application {
    pub fn new(config: DiagnosticsConfig) -> Result<Self> {
        let container = Arc::new(DependencyContainer::new(config)?);
        Ok(Self { container })
    }
}
