//! Periodic capacity refresh and delivery of the unit list to the watch subscriber.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::core::error::PluginError;
use crate::core::error::PublishDeliveryFailed;
use crate::core::registry::SharedPoolState;
use crate::core::sampler::CapacitySampler;
use crate::core::types::UnitList;

/// Buffered unit lists per subscriber before deliveries start timing out.
pub const DEFAULT_WATCH_CAPACITY: usize = 4;

/// Holds the single watch subscriber.
///
/// A new subscription replaces (and thereby closes) the previous one. Once
/// closed the hub accepts no further subscribers.
#[derive(Debug)]
pub struct WatchHub {
    capacity: usize,
    inner: Mutex<HubState>,
}

#[derive(Debug, Default)]
struct HubState {
    subscriber: Option<mpsc::Sender<UnitList>>,
    closed: bool,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CAPACITY)
    }
}

impl WatchHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HubState::default()),
        }
    }

    /// Installs a new subscriber whose stream starts with `initial`.
    pub fn subscribe(&self, initial: UnitList) -> Result<mpsc::Receiver<UnitList>, PluginError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PluginError::Stopped);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        // a fresh channel always has room for the first list
        if let Err(e) = tx.try_send(initial) {
            warn!("failed to queue initial unit list: {e}");
        }
        if inner.subscriber.replace(tx).is_some() {
            info!("replaced previous watch subscriber");
        }
        Ok(rx)
    }

    /// Delivers `units` to the current subscriber, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` when nobody is subscribed.
    pub async fn publish(
        &self,
        units: UnitList,
        timeout: Duration,
    ) -> Result<bool, PublishDeliveryFailed> {
        let Some(sender) = self.inner.lock().subscriber.clone() else {
            return Ok(false);
        };

        match sender.send_timeout(units, timeout).await {
            Ok(()) => Ok(true),
            Err(SendTimeoutError::Closed(_)) => {
                self.detach(&sender);
                Err(PublishDeliveryFailed::SubscriberGone)
            }
            Err(SendTimeoutError::Timeout(_)) => Err(PublishDeliveryFailed::Timeout(timeout)),
        }
    }

    fn detach(&self, sender: &mpsc::Sender<UnitList>) {
        let mut inner = self.inner.lock();
        if inner
            .subscriber
            .as_ref()
            .is_some_and(|current| current.same_channel(sender))
        {
            inner.subscriber = None;
        }
    }

    /// Closes the subscriber stream. Only the first call has an effect.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        inner.subscriber = None;
        true
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    pub fn has_subscriber(&self) -> bool {
        self.inner.lock().subscriber.is_some()
    }
}

/// Samples capacity every `interval`, rebuilds the registry and publishes changes.
#[derive(Debug)]
pub struct PublishLoop {
    state: SharedPoolState,
    sampler: Arc<dyn CapacitySampler>,
    hub: Arc<WatchHub>,
    interval: Duration,
    publish_timeout: Duration,
}

impl PublishLoop {
    pub fn new(
        state: SharedPoolState,
        sampler: Arc<dyn CapacitySampler>,
        hub: Arc<WatchHub>,
        interval: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            state,
            sampler,
            hub,
            interval,
            publish_timeout,
        }
    }

    /// One sampling and rebuild step. Returns the list to publish, if any.
    ///
    /// A unit replaced since the previous step also triggers a publish.
    pub fn refresh(&self, publish_anyway: bool) -> Option<UnitList> {
        let units = self.sampler.sample();

        let mut state = self.state.lock();
        let changed = state.apply_capacity(units);
        if changed {
            info!(
                resource = %state.spec().name,
                count = state.spec().count,
                "unit set changed"
            );
        }
        let dirty = state.take_dirty();
        if dirty && !changed {
            debug!("unit health changed since last publish");
        }
        (changed || dirty || publish_anyway).then(|| state.unit_list())
    }

    /// Runs until `cancellation_token` fires, then closes the watch stream and clears the registry.
    pub async fn run(self, cancellation_token: CancellationToken) {
        info!(interval = ?self.interval, "starting publish loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick always publishes
        let mut pending = true;

        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(units) = self.refresh(pending) else {
                debug!("unit set unchanged, skipping publish");
                continue;
            };
            pending = false;
            let count = units.len();

            select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                result = self.hub.publish(units, self.publish_timeout) => match result {
                    Ok(true) => debug!(count, "published unit list"),
                    Ok(false) => debug!(count, "no watch subscriber, nothing published"),
                    Err(e @ PublishDeliveryFailed::Timeout(_)) => {
                        warn!("failed to publish unit list: {e}");
                        pending = true;
                    }
                    Err(e) => warn!("failed to publish unit list: {e}"),
                }
            }
        }

        self.hub.close();
        self.state.lock().clear();
        info!("publish loop stopped");
    }
}
