//! # kubelet-api
//!
//! Protobuf definitions and generated gRPC bindings for the kubelet APIs this
//! agent talks to:
//! - the device plugin API (`v1beta1`): registration, list-and-watch,
//!   allocation,
//! - the pod-resources API (`v1alpha1`): listing per-container device
//!   assignments.
//!
//! The protocol constants (socket locations, API version, health strings) are
//! defined here so every consumer agrees on them.

// Generated protobuf code
pub mod device_plugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }
}

pub mod pod_resources {
    pub mod v1alpha1 {
        tonic::include_proto!("v1alpha1");
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use device_plugin::v1beta1::{
    device_plugin_client::DevicePluginClient,
    device_plugin_server::{DevicePlugin, DevicePluginServer},
    registration_client::RegistrationClient,
    AllocateRequest, AllocateResponse, CdiDevice, ContainerAllocateRequest,
    ContainerAllocateResponse, Device, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse, RegisterRequest,
};

pub use pod_resources::v1alpha1::{
    pod_resources_lister_client::PodResourcesListerClient, ContainerDevices, ContainerResources,
    ListPodResourcesRequest, ListPodResourcesResponse, PodResources,
};

/// Version of the device plugin API this agent implements.
pub const API_VERSION: &str = "v1beta1";

/// Directory the kubelet watches for device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// The kubelet's registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// The kubelet's pod-resources socket.
pub const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Health value advertised for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Health value advertised for a device whose node path is gone.
pub const UNHEALTHY: &str = "Unhealthy";
