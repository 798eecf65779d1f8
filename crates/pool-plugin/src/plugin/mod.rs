//! Plugin lifecycle: owns the pool state, the publish loop and the cancellation signal.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::config::PoolConfig;
use crate::core::allocation::AllocationHandler;
use crate::core::allocation::AllocationRequest;
use crate::core::allocation::AllocationResponse;
use crate::core::error::AllocationError;
use crate::core::error::PluginError;
use crate::core::publish::PublishLoop;
use crate::core::publish::WatchHub;
use crate::core::registry::DeviceRegistry;
use crate::core::registry::PoolState;
use crate::core::registry::SharedPoolState;
use crate::core::sampler::CapacitySampler;
use crate::core::types::Health;
use crate::core::types::ResourceSpec;
use crate::core::types::UnitList;

/// Static capability descriptor returned by `GetDevicePluginOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginOptions {
    pub pre_start_required: bool,
    pub get_preferred_allocation_available: bool,
}

/// Memory pool plugin
#[derive(Debug)]
pub struct PoolPlugin {
    resource_name: String,
    state: SharedPoolState,
    sampler: Arc<dyn CapacitySampler>,
    hub: Arc<WatchHub>,
    allocator: AllocationHandler,
    refresh_interval: Duration,
    publish_timeout: Duration,
    cancellation_token: CancellationToken,
    started: AtomicBool,
}

impl PoolPlugin {
    pub fn new(
        config: &PoolConfig,
        sampler: Arc<dyn CapacitySampler>,
        cancellation_token: CancellationToken,
    ) -> Arc<Self> {
        let registry = DeviceRegistry::new(config.unit_prefix.clone(), config.template.clone());
        let state = PoolState::new(config.resource_name.clone(), registry)
            .with_max_units(config.max_units)
            .shared();

        Arc::new(Self {
            resource_name: config.resource_name.clone(),
            allocator: AllocationHandler::new(state.clone()),
            state,
            sampler,
            hub: Arc::new(WatchHub::new(config.watch_capacity)),
            refresh_interval: config.refresh_interval,
            publish_timeout: config.publish_timeout,
            cancellation_token,
            started: AtomicBool::new(false),
        })
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn options(&self) -> PluginOptions {
        PluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    fn ensure_running(&self) -> Result<(), PluginError> {
        if self.is_stopped() {
            return Err(PluginError::Stopped);
        }
        Ok(())
    }

    /// Spawns the publish loop. It runs until the cancellation token fires.
    pub fn start(&self) -> Result<JoinHandle<()>, PluginError> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PluginError::AlreadyStarted);
        }

        let publish_loop = PublishLoop::new(
            self.state.clone(),
            self.sampler.clone(),
            self.hub.clone(),
            self.refresh_interval,
            self.publish_timeout,
        );
        let token = self.cancellation_token.clone();
        info!(resource = %self.resource_name, "starting pool plugin");
        Ok(tokio::spawn(publish_loop.run(token)))
    }

    /// Requests cancellation. Closes the watch stream even if the loop never ran.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
        if self.hub.close() {
            self.state.lock().clear();
            info!(resource = %self.resource_name, "pool plugin stopped");
        }
    }

    /// Attaches the watch subscriber. The stream starts with the current full unit list.
    pub fn watch(&self) -> Result<mpsc::Receiver<UnitList>, PluginError> {
        self.ensure_running()?;

        // subscribing under the pool lock keeps the initial list and later publishes in order
        let state = self.state.lock();
        let rx = self.hub.subscribe(state.unit_list())?;
        info!(
            resource = %state.spec().name,
            count = state.spec().count,
            "watch subscriber attached"
        );
        Ok(rx)
    }

    pub fn allocate(&self, request: &AllocationRequest) -> Result<AllocationResponse, PluginError> {
        self.ensure_running()?;
        Ok(self.allocator.allocate(request)?)
    }

    /// Acknowledges a container start; nothing has to be prepared per container.
    pub fn pre_start_container(&self, unit_ids: &[String]) -> Result<(), PluginError> {
        self.ensure_running()?;
        debug!(?unit_ids, "pre-start container acknowledged");
        Ok(())
    }

    /// One empty preference per container: the kubelet is free to choose.
    pub fn preferred_allocation(
        &self,
        container_count: usize,
    ) -> Result<Vec<Vec<String>>, PluginError> {
        self.ensure_running()?;
        Ok(vec![Vec::new(); container_count])
    }

    /// Replaces the unit entry with one carrying `health`.
    pub fn set_unit_health(&self, unit_id: &str, health: Health) -> Result<(), AllocationError> {
        let mut state = self.state.lock();
        let unit = state
            .registry()
            .get(unit_id)
            .map(|unit| unit.with_health(health))
            .ok_or_else(|| AllocationError::UnknownUnit(unit_id.to_string()))?;
        state.replace_unit(unit);
        info!(unit_id, %health, "unit health changed");
        Ok(())
    }

    /// Resource spec and unit list of the last completed rebuild.
    pub fn snapshot(&self) -> (ResourceSpec, UnitList) {
        let state = self.state.lock();
        (state.spec().clone(), state.unit_list())
    }
}
