use std::sync::Arc;

use crate::config::{AppConfig, ElevationMode, PrivilegeConfig};
use crate::core::ActiveOperations;
use crate::core::tools::ToolRunner;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub runner: ToolRunner,
    pub active: ActiveOperations,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        // Simulated drives are plain files, no escalation needed
        let runner = if config.simulation {
            ToolRunner::new(&PrivilegeConfig {
                mode: ElevationMode::Never,
                ..config.privileges.clone()
            })
        } else {
            ToolRunner::new(&config.privileges)
        };

        Self {
            config: Arc::new(config),
            runner,
            active: ActiveOperations::new(),
        }
    }
}
