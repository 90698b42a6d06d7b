//! Container Device Interface (CDI) support.
//!
//! This crate owns the two fixed external contracts the device plugin agent
//! relies on:
//! - the versioned CDI spec document written to the CDI directory for the
//!   container runtime ([`spec`]),
//! - the `cdi.k8s.io/` annotation and qualified device name conventions used
//!   to pass devices through allocation responses ([`annotations`]).

pub mod annotations;
pub mod spec;

pub use annotations::{
    annotation_key, annotation_value, qualified_name, update_annotations, ANNOTATION_PREFIX,
};
pub use spec::{CdiSpec, ContainerEdits, Device, DeviceNode, SpecFormat};

/// Version of the CDI spec schema this crate emits.
pub const CURRENT_VERSION: &str = "0.6.0";

/// Default device kind, also the vendor/class half of qualified device names.
pub const DEFAULT_KIND: &str = "nvidia.com/gpu";

/// Strategy name: pass the device list through CDI annotations.
pub const DEVICE_LIST_STRATEGY_CDI_ANNOTATIONS: &str = "cdi-annotations";

/// Strategy name: pass the device list through structured CRI CDI devices.
pub const DEVICE_LIST_STRATEGY_CDI_CRI: &str = "cdi-cri";

#[derive(Debug, thiserror::Error)]
pub enum CdiError {
    #[error("duplicate CDI annotation key: {0}")]
    DuplicateKey(String),

    #[error("invalid CDI annotation name: {0}")]
    InvalidName(String),

    #[error("unknown CDI spec format: {0}")]
    UnknownFormat(String),

    #[error("failed to serialize CDI spec to JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to serialize CDI spec to YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to write CDI spec: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CdiError>;
