use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::run::CapacityArgs;
use crate::config::run::RunArgs;
use crate::core::publish::DEFAULT_WATCH_CAPACITY;
use crate::core::registry::UnitTemplate;
use crate::core::registry::DEFAULT_MAX_UNITS;
use crate::core::sampler::CapacityRange;
use crate::core::sampler::CapacitySampler;
use crate::core::sampler::FixedCapacitySampler;
use crate::core::sampler::RandomCapacitySampler;
use crate::core::types::Injection;
use crate::core::types::MIB;

/// 1 GiB per unit.
pub const DEFAULT_UNIT_SIZE: u64 = 1024 * MIB;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid resource name {0:?}")]
    InvalidResourceName(String),
    #[error("invalid unit prefix {0:?}")]
    InvalidUnitPrefix(String),
    #[error("capacity range is inverted: min {min_mib} MiB > max {max_mib} MiB")]
    InvertedRange { min_mib: u64, max_mib: u64 },
    #[error("capacity of {max_mib} MiB does not fit in 64-bit bytes")]
    RangeOverflow { max_mib: u64 },
    #[error("unit size must be greater than zero")]
    ZeroUnitSize,
    #[error("configuration could advertise {units} units, more than the limit of {max_units}")]
    TooManyUnits { units: u64, max_units: u64 },
    #[error("refresh interval must be greater than zero")]
    ZeroRefreshInterval,
}

/// Validated settings of one plugin instance.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// domain-qualified resource name, e.g. "kove.net/memory"
    pub resource_name: String,
    pub unit_prefix: String,
    pub template: UnitTemplate,
    pub capacity: CapacityRange,
    pub unit_size: u64,
    pub fixed_units: Option<u64>,
    /// upper bound on the advertised unit count
    pub max_units: u64,
    pub refresh_interval: Duration,
    pub publish_timeout: Duration,
    pub watch_capacity: usize,
    /// env var listing granted unit ids; empty disables it
    pub allocated_units_env: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            resource_name: format!("{}/memory", crate::config::run::DEFAULT_DOMAIN),
            unit_prefix: "pool".to_string(),
            template: UnitTemplate::default(),
            capacity: CapacityRange::DEFAULT,
            unit_size: DEFAULT_UNIT_SIZE,
            fixed_units: None,
            max_units: DEFAULT_MAX_UNITS,
            refresh_interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(1),
            watch_capacity: DEFAULT_WATCH_CAPACITY,
            allocated_units_env: "KOVE_POOL_UNITS".to_string(),
        }
    }
}

impl PoolConfig {
    /// Sampler implementing the configured capacity policy.
    pub fn sampler(&self) -> Arc<dyn CapacitySampler> {
        match self.fixed_units {
            Some(units) => Arc::new(FixedCapacitySampler::new(units)),
            None => Arc::new(RandomCapacitySampler::new(self.capacity, self.unit_size)),
        }
    }
}

impl TryFrom<&RunArgs> for PoolConfig {
    type Error = ConfigError;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let resource_name = resource_name(&args.domain, &args.resource)?;
        if args.unit_prefix.is_empty() || args.unit_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidUnitPrefix(args.unit_prefix.clone()));
        }
        if args.refresh_interval_ms == 0 {
            return Err(ConfigError::ZeroRefreshInterval);
        }

        validate_capacity(&args.capacity, args.max_units)?;
        if let Some(units) = args.fixed_units {
            if units > args.max_units {
                return Err(ConfigError::TooManyUnits {
                    units,
                    max_units: args.max_units,
                });
            }
        }

        let injections = args
            .unit_devices
            .iter()
            .chain(&args.unit_mounts)
            .chain(&args.unit_envs)
            .cloned()
            .collect();

        Ok(Self {
            resource_name,
            unit_prefix: args.unit_prefix.clone(),
            template: UnitTemplate::new(injections),
            capacity: args.capacity.range(),
            unit_size: args.capacity.unit_size_bytes,
            fixed_units: args.fixed_units,
            max_units: args.max_units,
            refresh_interval: Duration::from_millis(args.refresh_interval_ms),
            publish_timeout: Duration::from_millis(args.publish_timeout_ms),
            watch_capacity: DEFAULT_WATCH_CAPACITY,
            allocated_units_env: args.allocated_units_env.clone(),
        })
    }
}

/// Joins domain and resource into the name registered with the kubelet.
pub fn resource_name(domain: &str, resource: &str) -> Result<String, ConfigError> {
    let domain = domain.trim_end_matches('/');
    let resource = resource.trim_start_matches('/');
    let name = format!("{domain}/{resource}");
    if domain.is_empty() || resource.is_empty() || resource.contains('/') {
        return Err(ConfigError::InvalidResourceName(name));
    }
    Ok(name)
}

/// Checks the capacity bounds and the largest unit count they can produce.
pub fn validate_capacity(capacity: &CapacityArgs, max_units: u64) -> Result<(), ConfigError> {
    let range = capacity.range();
    if range.min_mib > range.max_mib {
        return Err(ConfigError::InvertedRange {
            min_mib: range.min_mib,
            max_mib: range.max_mib,
        });
    }
    let max_bytes = range
        .max_mib
        .checked_mul(MIB)
        .ok_or(ConfigError::RangeOverflow {
            max_mib: range.max_mib,
        })?;
    if capacity.unit_size_bytes == 0 {
        return Err(ConfigError::ZeroUnitSize);
    }
    let units = max_bytes / capacity.unit_size_bytes;
    if units > max_units {
        return Err(ConfigError::TooManyUnits { units, max_units });
    }
    Ok(())
}

/// Parses `HOST[:CONTAINER]`.
pub fn parse_device(s: &str) -> Result<Injection, String> {
    let (host, container) = match s.split_once(':') {
        Some((host, container)) => (host, container),
        None => (s, s),
    };
    if host.is_empty() || container.is_empty() {
        return Err(format!("expected HOST[:CONTAINER], got {s:?}"));
    }
    Ok(Injection::Device {
        host_path: host.to_string(),
        container_path: container.to_string(),
    })
}

/// Parses `HOST[:CONTAINER][:ro|:rw]`.
pub fn parse_mount(s: &str) -> Result<Injection, String> {
    let mut parts: Vec<&str> = s.split(':').collect();
    let read_only = match parts.last() {
        Some(&"ro") if parts.len() > 1 => {
            parts.pop();
            true
        }
        Some(&"rw") if parts.len() > 1 => {
            parts.pop();
            false
        }
        _ => false,
    };
    let (host, container) = match parts.as_slice() {
        [host] => (*host, *host),
        [host, container] => (*host, *container),
        _ => return Err(format!("expected HOST[:CONTAINER][:ro], got {s:?}")),
    };
    if host.is_empty() || container.is_empty() {
        return Err(format!("expected HOST[:CONTAINER][:ro], got {s:?}"));
    }
    Ok(Injection::Mount {
        host_path: host.to_string(),
        container_path: container.to_string(),
        read_only,
    })
}

/// Parses `KEY=VALUE`.
pub fn parse_env(s: &str) -> Result<Injection, String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok(Injection::Env {
            key: key.to_string(),
            value: value.to_string(),
        }),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}
