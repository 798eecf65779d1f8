use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::app::core::ApplicationServices;
use crate::config::PoolConfig;
use crate::config::RunArgs;
use crate::platform::k8s::KubeletDevicePlugin;
use crate::plugin::PoolPlugin;

/// Builds the application from command line arguments
pub struct ApplicationBuilder {
    args: RunArgs,
}

impl ApplicationBuilder {
    pub fn new(args: RunArgs) -> Self {
        Self { args }
    }

    pub fn build(self) -> Result<Application> {
        let config = PoolConfig::try_from(&self.args).context("invalid plugin configuration")?;
        tracing::info!(
            resource = %config.resource_name,
            min_mib = config.capacity.min_mib,
            max_mib = config.capacity.max_mib,
            unit_size = config.unit_size,
            fixed_units = ?config.fixed_units,
            "pool configuration loaded"
        );

        let cancellation_token = CancellationToken::new();
        let plugin = PoolPlugin::new(&config, config.sampler(), cancellation_token.clone());
        let kubelet_plugin = KubeletDevicePlugin::new(
            self.args.endpoint.clone(),
            plugin.clone(),
            config.allocated_units_env.clone(),
        );

        let services = ApplicationServices {
            plugin,
            kubelet_plugin,
        };
        Ok(Application::new(services, self.args, cancellation_token))
    }
}
