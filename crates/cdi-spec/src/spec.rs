//! The versioned CDI spec document and its on-disk serialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CdiError, Result, CURRENT_VERSION, DEFAULT_KIND};

/// On-disk encoding of the CDI spec document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecFormat {
    Json,
    Yaml,
}

impl SpecFormat {
    /// File extension used for the chosen encoding, dot included.
    pub fn extension(&self) -> &'static str {
        match self {
            SpecFormat::Json => ".json",
            SpecFormat::Yaml => ".yaml",
        }
    }
}

impl FromStr for SpecFormat {
    type Err = CdiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(SpecFormat::Json),
            "yaml" | "yml" => Ok(SpecFormat::Yaml),
            other => Err(CdiError::UnknownFormat(other.to_string())),
        }
    }
}

/// A complete CDI spec document. Regenerated wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    #[serde(rename = "cdiVersion")]
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "ContainerEdits::is_empty")]
    pub container_edits: ContainerEdits,
}

/// One named device entry inside a spec document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

impl ContainerEdits {
    pub fn is_empty(&self) -> bool {
        self.device_nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
}

impl Default for CdiSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl CdiSpec {
    /// An empty document at the current schema version with the default kind.
    pub fn new() -> Self {
        CdiSpec {
            version: CURRENT_VERSION.to_string(),
            kind: DEFAULT_KIND.to_string(),
            annotations: HashMap::new(),
            devices: Vec::new(),
            container_edits: ContainerEdits::default(),
        }
    }

    /// Appends a device entry. Names are expected to be unique within the
    /// document; the writer derives them from unique device indices.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        annotations: HashMap<String, String>,
        device_nodes: Vec<DeviceNode>,
    ) {
        self.devices.push(Device {
            name: name.into(),
            annotations,
            container_edits: ContainerEdits { device_nodes },
        });
    }

    /// Serializes the document into `dir/<name><ext>` atomically: the content
    /// is written to a temp file in the same directory and renamed over the
    /// destination. Returns the final path.
    pub fn save(&self, dir: impl AsRef<Path>, name: &str, format: SpecFormat) -> Result<PathBuf> {
        let dir = dir.as_ref();
        let path = dir.join(format!("{name}{}", format.extension()));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        match format {
            SpecFormat::Json => serde_json::to_writer_pretty(&mut tmp, self)?,
            SpecFormat::Yaml => serde_yaml::to_writer(&mut tmp, self)?,
        }
        tmp.persist(&path).map_err(|e| CdiError::Io(e.error))?;

        Ok(path)
    }

    /// Parses a document previously produced by [`CdiSpec::save`].
    pub fn parse(content: &str, format: SpecFormat) -> Result<CdiSpec> {
        match format {
            SpecFormat::Json => Ok(serde_json::from_str(content)?),
            SpecFormat::Yaml => Ok(serde_yaml::from_str(content)?),
        }
    }
}
