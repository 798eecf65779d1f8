use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::tasks::Tasks;
use crate::config::RunArgs;
use crate::platform::k8s::KubeletDevicePlugin;
use crate::plugin::PoolPlugin;

/// Long-lived components shared by the application tasks
#[derive(Debug, Clone)]
pub struct ApplicationServices {
    pub plugin: Arc<PoolPlugin>,
    pub kubelet_plugin: Arc<KubeletDevicePlugin>,
}

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    run_args: RunArgs,
    cancellation_token: CancellationToken,
}

impl Application {
    pub fn new(
        services: ApplicationServices,
        run_args: RunArgs,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            services,
            run_args,
            cancellation_token,
        }
    }

    /// Get access to services
    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    /// Get run arguments
    pub fn run_args(&self) -> &RunArgs {
        &self.run_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new(self.cancellation_token.clone());

        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            self.cancellation_token.cancel();
            return Err(e);
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Gracefully shutdown application
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        self.services.plugin.stop();

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
