//! Translates validated device indices into a container allocate response,
//! using whichever device-list delivery strategies are enabled.

use std::collections::HashMap;

use anyhow::{Context, Result};
use kubelet_api::device_plugin::v1beta1::{CdiDevice, ContainerAllocateResponse};
use tracing::debug;
use uuid::Uuid;

/// CDI vendor half of qualified device names.
pub const CDI_VENDOR: &str = "nvidia.com";

/// CDI class half of qualified device names.
pub const CDI_CLASS: &str = "gpu";

/// Plugin name embedded in CDI annotation keys.
pub const PLUGIN_NAME: &str = "xpu-device-plugin";

/// Which strategies are enabled when passing the device list to the
/// container runtime. Fixed at plugin construction.
#[derive(Debug, Clone)]
pub struct DeviceListStrategies {
    strategies: HashMap<&'static str, bool>,
}

impl DeviceListStrategies {
    pub fn new(annotations: bool, cri: bool) -> Self {
        Self {
            strategies: HashMap::from([
                (cdi_spec::DEVICE_LIST_STRATEGY_CDI_ANNOTATIONS, annotations),
                (cdi_spec::DEVICE_LIST_STRATEGY_CDI_CRI, cri),
            ]),
        }
    }

    /// Whether the given strategy is enabled.
    pub fn includes(&self, strategy: &str) -> bool {
        self.strategies.get(strategy).copied().unwrap_or(false)
    }
}

impl Default for DeviceListStrategies {
    fn default() -> Self {
        Self::new(false, true)
    }
}

/// Builds per-container allocate responses for a fixed strategy set and
/// annotation prefix.
#[derive(Debug)]
pub struct ResponseBuilder {
    strategies: DeviceListStrategies,
    annotation_prefix: String,
}

impl ResponseBuilder {
    pub fn new(strategies: DeviceListStrategies, annotation_prefix: impl Into<String>) -> Self {
        Self {
            strategies,
            annotation_prefix: annotation_prefix.into(),
        }
    }

    /// Builds a response carrying the requested devices through every
    /// enabled strategy. A fresh correlation id tags the CDI annotations of
    /// each call. An empty index list yields an empty response, not an error.
    pub fn build(&self, device_indexes: &[u32]) -> Result<ContainerAllocateResponse> {
        let mut response = ContainerAllocateResponse::default();

        let devices: Vec<String> = device_indexes
            .iter()
            .map(|index| cdi_spec::qualified_name(CDI_VENDOR, CDI_CLASS, &index.to_string()))
            .collect();
        if devices.is_empty() {
            debug!("no device indexes requested, returning empty response");
            return Ok(response);
        }

        let response_id = Uuid::new_v4().to_string();

        if self
            .strategies
            .includes(cdi_spec::DEVICE_LIST_STRATEGY_CDI_ANNOTATIONS)
        {
            response.annotations = self.device_annotations(&response_id, &devices)?;
        }
        if self
            .strategies
            .includes(cdi_spec::DEVICE_LIST_STRATEGY_CDI_CRI)
        {
            response.cdi_devices = devices
                .iter()
                .map(|name| CdiDevice { name: name.clone() })
                .collect();
        }

        Ok(response)
    }

    fn device_annotations(
        &self,
        response_id: &str,
        devices: &[String],
    ) -> Result<HashMap<String, String>> {
        let annotations =
            cdi_spec::update_annotations(HashMap::new(), PLUGIN_NAME, response_id, devices)
                .context("failed to add CDI annotations")?;

        if self.annotation_prefix == cdi_spec::ANNOTATION_PREFIX {
            return Ok(annotations);
        }

        // rewrite keys under the configured custom prefix
        Ok(annotations
            .into_iter()
            .map(|(key, value)| {
                let key = match key.strip_prefix(cdi_spec::ANNOTATION_PREFIX) {
                    Some(rest) => format!("{}{rest}", self.annotation_prefix),
                    None => key,
                };
                (key, value)
            })
            .collect())
    }
}
