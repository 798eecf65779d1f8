//! Allocation handshake.

use tracing::debug;

use crate::core::error::AllocationError;
use crate::core::registry::DeviceRegistry;
use crate::core::registry::SharedPoolState;
use crate::core::types::Injection;

/// Units requested for one container, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    pub unit_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    pub containers: Vec<ContainerRequest>,
}

/// What one container receives: the granted identifiers and their concatenated injections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerGrant {
    pub unit_ids: Vec<String>,
    pub injections: Vec<Injection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationResponse {
    pub containers: Vec<ContainerGrant>,
}

/// Evaluates `request` against `registry`.
///
/// All-or-nothing: the first unknown or unhealthy unit rejects the whole request.
/// Repeated identifiers are granted as many times as they are named.
/// A request without containers is valid and yields no grants.
pub fn allocate_from(
    registry: &DeviceRegistry,
    request: &AllocationRequest,
) -> Result<AllocationResponse, AllocationError> {
    let mut containers = Vec::with_capacity(request.containers.len());

    for (index, container) in request.containers.iter().enumerate() {
        if container.unit_ids.is_empty() {
            return Err(AllocationError::EmptyContainerRequest(index));
        }

        let mut injections = Vec::new();
        for id in &container.unit_ids {
            let unit = registry
                .get(id)
                .ok_or_else(|| AllocationError::UnknownUnit(id.clone()))?;
            if !unit.is_healthy() {
                return Err(AllocationError::UnhealthyUnit(id.clone()));
            }
            injections.extend(unit.injections.iter().cloned());
        }

        containers.push(ContainerGrant {
            unit_ids: container.unit_ids.clone(),
            injections,
        });
    }

    Ok(AllocationResponse { containers })
}

/// Fulfils allocation requests against the latest committed registry.
#[derive(Debug, Clone)]
pub struct AllocationHandler {
    state: SharedPoolState,
}

impl AllocationHandler {
    pub fn new(state: SharedPoolState) -> Self {
        Self { state }
    }

    /// Holds the pool lock for the whole evaluation, never across a suspend point.
    pub fn allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<AllocationResponse, AllocationError> {
        let state = self.state.lock();
        let response = allocate_from(state.registry(), request)?;
        debug!(
            containers = response.containers.len(),
            registry_size = state.registry().len(),
            "allocation granted"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::core::registry::PoolState;
    use crate::core::registry::UnitTemplate;
    use crate::core::types::Health;

    fn mount(unit: &str) -> Injection {
        Injection::Mount {
            host_path: format!("/var/lib/pool/{unit}"),
            container_path: format!("/pool/{unit}"),
            read_only: false,
        }
    }

    fn registry(count: usize) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(
            "pool",
            UnitTemplate::new(vec![Injection::Mount {
                host_path: "/var/lib/pool/{unit}".to_string(),
                container_path: "/pool/{unit}".to_string(),
                read_only: false,
            }]),
        );
        registry.rebuild(count);
        registry
    }

    fn request(containers: &[&[&str]]) -> AllocationRequest {
        AllocationRequest {
            containers: containers
                .iter()
                .map(|ids| ContainerRequest {
                    unit_ids: ids.iter().map(|id| id.to_string()).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn grants_preserve_request_order() {
        let registry = registry(2);

        let response =
            allocate_from(&registry, &request(&[&["pool-1", "pool-0"]])).expect("should allocate");

        assert_eq!(response.containers.len(), 1);
        assert_eq!(
            response.containers[0].injections,
            vec![mount("pool-1"), mount("pool-0")]
        );
        assert_eq!(
            response.containers[0].unit_ids,
            vec!["pool-1".to_string(), "pool-0".to_string()]
        );
    }

    #[test]
    fn unknown_unit_rejects_whole_request() {
        let registry = registry(1);

        let err = allocate_from(&registry, &request(&[&["pool-0"], &["pool-0", "pool-7"]]))
            .expect_err("pool-7 does not exist");
        assert_eq!(err, AllocationError::UnknownUnit("pool-7".to_string()));
    }

    #[test]
    fn unhealthy_unit_rejects_whole_request() {
        let mut registry = registry(2);
        let sick = registry
            .get("pool-1")
            .expect("pool-1 exists")
            .with_health(Health::Unhealthy);
        registry.replace_unit(sick);

        let err = allocate_from(&registry, &request(&[&["pool-0", "pool-1"]]))
            .expect_err("pool-1 is unhealthy");
        assert_eq!(err, AllocationError::UnhealthyUnit("pool-1".to_string()));
    }

    #[test]
    fn duplicate_ids_are_granted_literally() {
        let registry = registry(1);

        let response = allocate_from(&registry, &request(&[&["pool-0", "pool-0"]]))
            .expect("duplicates are honored");
        assert_eq!(
            response.containers[0].injections,
            vec![mount("pool-0"), mount("pool-0")]
        );
    }

    #[test]
    fn multiple_containers_get_separate_grants() {
        let registry = registry(3);

        let response = allocate_from(&registry, &request(&[&["pool-2"], &["pool-0", "pool-1"]]))
            .expect("should allocate");
        assert_eq!(response.containers.len(), 2);
        assert_eq!(response.containers[0].injections, vec![mount("pool-2")]);
        assert_eq!(
            response.containers[1].injections,
            vec![mount("pool-0"), mount("pool-1")]
        );
    }

    #[test]
    fn empty_request_is_valid_and_empty() {
        let registry = registry(1);

        let response = allocate_from(&registry, &AllocationRequest::default())
            .expect("no containers is a valid request");
        assert_eq!(response, AllocationResponse::default());
    }

    #[test]
    fn empty_container_is_rejected() {
        let registry = registry(1);

        let err = allocate_from(&registry, &request(&[&["pool-0"], &[]]))
            .expect_err("second container names nothing");
        assert_eq!(err, AllocationError::EmptyContainerRequest(1));
    }

    #[test]
    fn handler_reads_shared_state() {
        let mut state = PoolState::new("kove.net/memory", registry(0));
        state.apply_capacity(1);
        let shared = state.shared();
        let handler = AllocationHandler::new(shared.clone());

        assert!(handler.allocate(&request(&[&["pool-0"]])).is_ok());

        shared.lock().apply_capacity(0);
        assert_eq!(
            handler.allocate(&request(&[&["pool-0"]])),
            Err(AllocationError::UnknownUnit("pool-0".to_string()))
        );
    }
}
