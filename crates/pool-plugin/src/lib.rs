//! Kubelet device plugin advertising a dynamically sized memory pool.
//!
//! The [`core`] module holds the registry, the capacity sampler, the publish
//! loop and the allocation handler. [`plugin::PoolPlugin`] ties them together
//! and [`platform::k8s`] exposes it over the kubelet device plugin API.

pub mod app;
pub mod config;
pub mod core;
pub mod platform;
pub mod plugin;
