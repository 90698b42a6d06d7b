//! Node agent that exposes VFIO-bound GPUs to the kubelet.
//!
//! The agent scans the PCI bus once at startup, groups devices by IOMMU
//! group, writes a CDI spec for the container runtime, and runs one device
//! plugin gRPC server per GPU model found on the node. Each server keeps its
//! advertised device list fresh through a filesystem-event health monitor
//! that also detects kubelet restarts and re-registers by restarting the
//! whole server.

pub mod catalog;
pub mod cdi_writer;
pub mod config;
pub mod discovery;
pub mod health;
pub mod logging;
pub mod plugin;
pub mod pod_resources;
pub mod response;
