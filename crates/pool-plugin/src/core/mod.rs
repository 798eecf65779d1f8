//! Advertisement and allocation engine.

pub mod allocation;
pub mod error;
pub mod publish;
pub mod registry;
pub mod sampler;
pub mod types;

pub use allocation::AllocationHandler;
pub use allocation::AllocationRequest;
pub use allocation::AllocationResponse;
pub use allocation::ContainerGrant;
pub use allocation::ContainerRequest;
pub use error::AllocationError;
pub use error::EntropyUnavailable;
pub use error::PluginError;
pub use error::PublishDeliveryFailed;
pub use publish::PublishLoop;
pub use publish::WatchHub;
pub use registry::DeviceRegistry;
pub use registry::PoolState;
pub use registry::SharedPoolState;
pub use registry::UnitTemplate;
pub use sampler::CapacityRange;
pub use sampler::CapacitySampler;
pub use sampler::FixedCapacitySampler;
pub use sampler::RandomCapacitySampler;
pub use types::Health;
pub use types::Injection;
pub use types::ResourceSpec;
pub use types::Unit;
pub use types::UnitList;
