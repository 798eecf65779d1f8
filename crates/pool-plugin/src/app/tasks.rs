use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Tasks {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token,
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let publish_task = self.spawn_publish_task(app)?;
        self.tasks.push(publish_task);

        let device_plugin_task = self.spawn_device_plugin_task(app);
        self.tasks.push(device_plugin_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let signal_handler = tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        });

        let outcome = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                Ok(())
            }
            _ = self.cancellation_token.cancelled() => {
                tracing::info!("Cancellation requested, stopping all tasks");
                Ok(())
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                // a finished handle must not be awaited again
                self.tasks.remove(index);
                match result {
                    Err(e) => {
                        tracing::error!("Task completed with error: {e}");
                        Err(e.into())
                    }
                    Ok(()) => {
                        tracing::warn!("Task completed unexpectedly");
                        Err(anyhow::anyhow!("background task exited before shutdown"))
                    }
                }
            }
        };

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
        outcome
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_publish_task(&self, app: &Application) -> Result<JoinHandle<()>> {
        let plugin = app.services().plugin.clone();
        let handle = plugin.start()?;

        Ok(tokio::spawn(async move {
            tracing::info!("Starting publish loop task");
            if let Err(e) = handle.await {
                tracing::error!("Publish loop task failed: {e}");
            } else {
                tracing::info!("Publish loop task completed");
            }
        }))
    }

    fn spawn_device_plugin_task(&self, app: &Application) -> JoinHandle<()> {
        let args = app.run_args();
        let kubelet_plugin = app.services().kubelet_plugin.clone();
        let socket_path = args.plugin_socket_path();
        let kubelet_socket_path = args.kubelet_socket_path();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting device plugin task");

            if let Err(e) = kubelet_plugin
                .run(socket_path, kubelet_socket_path, token)
                .await
            {
                tracing::error!("Device plugin failed: {e:?}");
                return;
            }

            tracing::info!("Device plugin task completed");
        })
    }
}
