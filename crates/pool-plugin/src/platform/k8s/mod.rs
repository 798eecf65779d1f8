//! Kubernetes integration
//!
//! Exposes the pool plugin to the kubelet over the device plugin gRPC API.

pub mod device_plugin;

pub use device_plugin::DevicePluginService;
pub use device_plugin::KubeletDevicePlugin;
