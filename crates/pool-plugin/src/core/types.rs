use derive_more::Display;

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Placeholder substituted with the unit identifier in template paths and values.
pub const UNIT_PLACEHOLDER: &str = "{unit}";

/// Identifies the advertised resource and its current unit count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// domain-qualified resource name, e.g. "kove.net/memory"
    pub name: String,
    /// number of allocatable units after the last completed rebuild
    pub count: u64,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 0,
        }
    }
}

/// Health of a unit, rendered the way the kubelet expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Health {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// A single container edit granted together with a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// device node exposed to the container
    Device {
        host_path: String,
        container_path: String,
    },
    /// bind mount into the container
    Mount {
        host_path: String,
        container_path: String,
        read_only: bool,
    },
    /// environment variable set in the container
    Env { key: String, value: String },
}

impl Injection {
    /// Returns a copy with every `{unit}` placeholder replaced by `unit_id`.
    pub fn render(&self, unit_id: &str) -> Self {
        let sub = |s: &str| s.replace(UNIT_PLACEHOLDER, unit_id);
        match self {
            Injection::Device {
                host_path,
                container_path,
            } => Injection::Device {
                host_path: sub(host_path),
                container_path: sub(container_path),
            },
            Injection::Mount {
                host_path,
                container_path,
                read_only,
            } => Injection::Mount {
                host_path: sub(host_path),
                container_path: sub(container_path),
                read_only: *read_only,
            },
            Injection::Env { key, value } => Injection::Env {
                key: key.clone(),
                value: sub(value),
            },
        }
    }
}

/// One allocatable instance of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub health: Health,
    pub injections: Vec<Injection>,
}

impl Unit {
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }

    /// Builds the replacement entry carrying a different health.
    pub fn with_health(&self, health: Health) -> Self {
        Self {
            health,
            ..self.clone()
        }
    }
}

/// Full unit list as delivered to a watch subscriber.
pub type UnitList = Vec<Unit>;
