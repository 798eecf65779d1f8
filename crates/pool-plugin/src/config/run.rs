use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use utils::logging::LogFormat;

use crate::config::pool::parse_device;
use crate::config::pool::parse_env;
use crate::config::pool::parse_mount;
use crate::config::pool::DEFAULT_UNIT_SIZE;
use crate::core::registry::DEFAULT_MAX_UNITS;
use crate::core::sampler::CapacityRange;
use crate::core::types::Injection;

pub const DEFAULT_DOMAIN: &str = "kove.net";

/// Capacity bounds shared by `run` and `sample-capacity`.
#[derive(Args, Clone, Debug)]
pub struct CapacityArgs {
    #[arg(
        long,
        env = "POOL_CAPACITY_MIN_MIB",
        default_value_t = CapacityRange::DEFAULT.min_mib,
        help = "Lower bound of the sampled pool capacity in MiB (inclusive)"
    )]
    pub capacity_min_mib: u64,

    #[arg(
        long,
        env = "POOL_CAPACITY_MAX_MIB",
        default_value_t = CapacityRange::DEFAULT.max_mib,
        help = "Upper bound of the sampled pool capacity in MiB (exclusive; equal to min pins it)"
    )]
    pub capacity_max_mib: u64,

    #[arg(
        long,
        env = "POOL_UNIT_SIZE_BYTES",
        default_value_t = DEFAULT_UNIT_SIZE,
        help = "Bytes per allocatable unit; capacity is truncated to whole units"
    )]
    pub unit_size_bytes: u64,
}

impl CapacityArgs {
    pub fn range(&self) -> CapacityRange {
        CapacityRange {
            min_mib: self.capacity_min_mib,
            max_mib: self.capacity_max_mib,
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        env = "KOVE_DOMAIN",
        default_value = DEFAULT_DOMAIN,
        help = "The domain to use when declaring devices"
    )]
    pub domain: String,

    #[arg(
        long,
        env = "KOVE_RESOURCE",
        default_value = "memory",
        help = "Resource name under the domain, e.g. memory for kove.net/memory"
    )]
    pub resource: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIRECTORY",
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "The directory in which to create plugin sockets; must contain kubelet.sock"
    )]
    pub plugin_directory: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_ENDPOINT",
        default_value = "kove-memory.sock",
        help = "Socket file name of this plugin inside the plugin directory"
    )]
    pub endpoint: String,

    #[arg(
        long,
        env = "REFRESH_INTERVAL_MS",
        default_value = "5000",
        help = "Capacity refresh interval in milliseconds"
    )]
    pub refresh_interval_ms: u64,

    #[arg(
        long,
        default_value = "1000",
        help = "How long a unit list delivery may wait for the kubelet, in milliseconds"
    )]
    pub publish_timeout_ms: u64,

    #[command(flatten)]
    pub capacity: CapacityArgs,

    #[arg(
        long,
        env = "POOL_UNIT_PREFIX",
        default_value = "pool",
        help = "Prefix of unit identifiers (<prefix>-<index>)"
    )]
    pub unit_prefix: String,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_UNITS,
        help = "Refuse configurations that could advertise more units than this"
    )]
    pub max_units: u64,

    #[arg(
        long,
        help = "Advertise a constant number of units instead of sampling capacity"
    )]
    pub fixed_units: Option<u64>,

    #[arg(
        long = "unit-device",
        value_parser = parse_device,
        help = "Device node granted with every unit, HOST[:CONTAINER]; {unit} is the unit id"
    )]
    pub unit_devices: Vec<Injection>,

    #[arg(
        long = "unit-mount",
        value_parser = parse_mount,
        help = "Bind mount granted with every unit, HOST[:CONTAINER][:ro]; {unit} is the unit id"
    )]
    pub unit_mounts: Vec<Injection>,

    #[arg(
        long = "unit-env",
        value_parser = parse_env,
        help = "Env var granted with every unit, KEY=VALUE; {unit} is the unit id"
    )]
    pub unit_envs: Vec<Injection>,

    #[arg(
        long,
        default_value = "KOVE_POOL_UNITS",
        help = "Environment variable listing the granted unit ids, empty to disable"
    )]
    pub allocated_units_env: String,

    #[arg(
        long,
        env = "LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
}

impl RunArgs {
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.plugin_directory.join("kubelet.sock")
    }

    pub fn plugin_socket_path(&self) -> PathBuf {
        self.plugin_directory.join(&self.endpoint)
    }
}

#[derive(Parser, Clone, Debug)]
pub struct SampleCapacityArgs {
    #[command(flatten)]
    pub capacity: CapacityArgs,

    #[arg(long, help = "Also print the number of whole units")]
    pub units: bool,
}
