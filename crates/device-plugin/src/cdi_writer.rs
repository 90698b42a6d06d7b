//! Builds the CDI spec document from the discovered inventory and writes it
//! to the CDI directory. Writing is best effort: the device plugin servers
//! operate from the in-memory inventory either way, and the document is
//! regenerated wholesale on every process start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cdi_spec::{CdiSpec, DeviceNode, SpecFormat};

use crate::discovery::Inventory;

/// File stem of the emitted spec document.
pub const CDI_SPEC_NAME: &str = "cdi-vfio-devices";

/// Directory holding the VFIO group character devices.
pub const VFIO_DEVICE_PATH: &str = "/dev/vfio";

/// One spec device entry per discovered GPU: named by its index, annotated
/// with the IOMMU group, the PCI address and the attach flag, and granting
/// the group's VFIO character device.
pub fn generate(inventory: &Inventory) -> CdiSpec {
    let mut spec = CdiSpec::new();

    for (group, devices) in inventory.iommu_groups() {
        for dev in devices {
            let annotations = HashMap::from([
                ("attach-pci".to_string(), "true".to_string()),
                ("bdf".to_string(), dev.addr.clone()),
                (
                    format!("{}vfio{group}", cdi_spec::ANNOTATION_PREFIX),
                    format!("{}={}", cdi_spec::DEFAULT_KIND, dev.index),
                ),
            ]);
            spec.add_device(
                dev.index.to_string(),
                annotations,
                vec![DeviceNode {
                    path: format!("{VFIO_DEVICE_PATH}/{group}"),
                }],
            );
        }
    }

    spec
}

/// Generates and saves the spec document for `inventory`.
pub fn write(inventory: &Inventory, dir: &Path, format: SpecFormat) -> cdi_spec::Result<PathBuf> {
    generate(inventory).save(dir, CDI_SPEC_NAME, format)
}
