//! CDI annotation and qualified device name helpers.
//!
//! The container runtime picks devices up either from `cdi.k8s.io/...`
//! annotations or from structured CRI fields; both carry fully qualified
//! device names of the form `vendor/class=id`.

use std::collections::HashMap;

use crate::{CdiError, Result};

/// Default prefix for CDI container annotation keys.
pub const ANNOTATION_PREFIX: &str = "cdi.k8s.io/";

// Annotation names must be usable as a Kubernetes annotation path segment.
const MAX_NAME_LEN: usize = 63;

/// Constructs a fully qualified CDI device name for the given resource,
/// e.g. `qualified_name("nvidia.com", "gpu", "0")` -> `nvidia.com/gpu=0`.
pub fn qualified_name(vendor: &str, class: &str, id: &str) -> String {
    format!("{vendor}/{class}={id}")
}

/// Builds the annotation key for a plugin/device-id pair under the default
/// prefix. Slashes in the device id are flattened so the key stays a single
/// path segment.
pub fn annotation_key(plugin_name: &str, device_id: &str) -> Result<String> {
    let name = format!("{}_{}", plugin_name, device_id.replace('/', "_"));

    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CdiError::InvalidName(name));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    let alnum_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !valid || !alnum_ends {
        return Err(CdiError::InvalidName(name));
    }

    Ok(format!("{ANNOTATION_PREFIX}{name}"))
}

/// Joins qualified device names into an annotation value.
pub fn annotation_value(devices: &[String]) -> String {
    devices.join(",")
}

/// Adds an annotation carrying `devices` to `annotations`, keyed by the
/// plugin name and device id. Fails if the key is already present.
pub fn update_annotations(
    mut annotations: HashMap<String, String>,
    plugin_name: &str,
    device_id: &str,
    devices: &[String],
) -> Result<HashMap<String, String>> {
    let key = annotation_key(plugin_name, device_id)?;
    if annotations.contains_key(&key) {
        return Err(CdiError::DuplicateKey(key));
    }
    annotations.insert(key, annotation_value(devices));
    Ok(annotations)
}
