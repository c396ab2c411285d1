//! A simulated network of sensor nodes that coordinate without any central server. Every node
//! keeps a Lamport clock, watches its peers' heartbeats, elects a coordinator with the Bully
//! algorithm, takes turns multicasting readings under a circulating token, and joins
//! Chandy-Lamport snapshots of the whole network.
//!
//! Start with [`cluster::SensorNode`]. [`testkit::MemoryNetwork`] runs a whole cluster in one
//! process; [`core::UdpTransport`] runs one node per process.

pub mod cluster;
pub mod core;
pub mod sensor;
pub mod storage;
pub mod testkit;
