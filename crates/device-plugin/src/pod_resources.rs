//! Client side of the kubelet pod-resources API, used to inspect which pods
//! currently hold our devices.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use kubelet_api::{ListPodResourcesRequest, PodResources, PodResourcesListerClient};
use tracing::debug;

use crate::plugin::connect_uds;

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

// The kubelet caps pod-resources responses at 16 MiB; match it so large
// nodes do not trip the tonic default.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Lists per-pod device assignments from the kubelet's pod-resources socket.
pub async fn list_pod_resources(socket: &Path) -> Result<Vec<PodResources>> {
    let channel = connect_uds(socket, LIST_TIMEOUT)
        .await
        .context("failed to dial pod-resources socket")?;
    let mut client =
        PodResourcesListerClient::new(channel).max_decoding_message_size(MAX_MESSAGE_SIZE);

    let response = tokio::time::timeout(
        LIST_TIMEOUT,
        client.list(ListPodResourcesRequest::default()),
    )
    .await
    .context("pod-resources list call timed out")?
    .context("pod-resources list call failed")?;

    let pods = response.into_inner().pod_resources;
    debug!("kubelet reported resources for {} pods", pods.len());
    Ok(pods)
}

/// Device ids of `resource_name` assigned to containers of the given pods.
pub fn assigned_device_ids(pods: &[PodResources], resource_name: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for pod in pods {
        for container in &pod.containers {
            for devices in &container.devices {
                if devices.resource_name == resource_name {
                    ids.extend(devices.device_ids.iter().cloned());
                }
            }
        }
    }
    ids
}
