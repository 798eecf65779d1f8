use std::time::Duration;

use thiserror::Error;

/// The secure entropy source could not be used; recovered by the sampler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("secure entropy source unavailable: {reason}")]
pub struct EntropyUnavailable {
    pub reason: String,
}

/// Reasons an allocation request is rejected. A rejection always covers the whole request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("requested unit does not exist {0:?}")]
    UnknownUnit(String),
    #[error("requested unit is not healthy {0:?}")]
    UnhealthyUnit(String),
    #[error("container request #{0} names no units")]
    EmptyContainerRequest(usize),
}

/// Errors surfaced by the plugin to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("plugin is stopped")]
    Stopped,
    #[error("publish loop already started")]
    AlreadyStarted,
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// A unit list could not be handed to the watch subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishDeliveryFailed {
    #[error("watch subscriber is gone")]
    SubscriberGone,
    #[error("watch subscriber did not accept the update within {0:?}")]
    Timeout(Duration),
}
