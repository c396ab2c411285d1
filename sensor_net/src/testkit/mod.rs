//! Tools for running whole clusters inside one process. [`LocalCluster`] spawns the nodes on a
//! fault-injecting [`MemoryNetwork`], whose faults a [`FailureConfig`] describes.

mod failure_config;
mod local_cluster;
pub mod logging;
mod memory_network;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  local_cluster::LocalCluster,
  logging::LogLevel,
  memory_network::MemoryEndpoint,
  memory_network::MemoryNetwork,
};
