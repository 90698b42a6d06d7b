//! PCI bus discovery: find GPUs bound to the VFIO passthrough driver and
//! group them by IOMMU group.
//!
//! The scan runs exactly once at process start; the resulting [`Inventory`]
//! is immutable and shared by reference with every component that needs it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// PCI vendor id of NVIDIA devices, as read from sysfs (without the 0x prefix).
pub const NVIDIA_VENDOR_ID: &str = "10de";

/// Driver a device must be bound to before it is exposed for allocation.
pub const VFIO_DRIVER: &str = "vfio-pci";

/// A physical GPU bound to the passthrough driver.
///
/// The index reflects discovery order and is stable for the lifetime of the
/// process; it is unique but carries no guarantee about physical slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    /// PCI address, e.g. `0000:c1:00.0`.
    pub addr: String,
    pub index: u32,
}

/// Read access to the PCI bus topology. Injected into the scanner and the
/// allocation-time revalidation so tests can substitute a fake bus.
pub trait BusReader: Send + Sync {
    /// Lists the PCI addresses under the bus directory, in walk order.
    fn list_devices(&self) -> io::Result<Vec<String>>;

    /// Reads an id file (`vendor`, `device`) for a device, 0x prefix stripped.
    fn read_id(&self, addr: &str, property: &str) -> io::Result<String>;

    /// Resolves a symlink (`driver`, `iommu_group`) to its target's basename.
    fn read_link(&self, addr: &str, link: &str) -> io::Result<String>;
}

/// [`BusReader`] backed by the real sysfs tree.
pub struct SysfsBusReader {
    base: PathBuf,
}

impl SysfsBusReader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl BusReader for SysfsBusReader {
    fn list_devices(&self) -> io::Result<Vec<String>> {
        let mut addrs = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            addrs.push(entry.file_name().to_string_lossy().into_owned());
        }
        addrs.sort();
        Ok(addrs)
    }

    fn read_id(&self, addr: &str, property: &str) -> io::Result<String> {
        let data = fs::read_to_string(self.base.join(addr).join(property))?;
        // sysfs id files look like "0x10de\n"
        Ok(data.trim().trim_start_matches("0x").to_string())
    }

    fn read_link(&self, addr: &str, link: &str) -> io::Result<String> {
        let target = fs::read_link(self.base.join(addr).join(link))?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("symlink {link} for device {addr} has no basename"),
                )
            })
    }
}

/// Immutable device inventory built from one bus scan.
///
/// Two derived indices: IOMMU group id to the devices sharing that group, and
/// device model id to the groups advertised under that model. A group's model
/// classification is fixed by the first device observed in it.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    iommu_map: HashMap<String, Vec<GpuDevice>>,
    device_map: HashMap<String, Vec<String>>,
}

impl Inventory {
    /// Walks the bus and builds the inventory.
    ///
    /// Per-device read failures skip that device with a warning; failing to
    /// enumerate the bus directory aborts the scan.
    pub fn scan(bus: &dyn BusReader, vendor: &str, driver: &str) -> Result<Inventory> {
        let mut inventory = Inventory::default();
        let mut bus_index: u32 = 0;

        let addrs = bus
            .list_devices()
            .context("failed to enumerate PCI devices")?;

        for addr in addrs {
            let vendor_id = match bus.read_id(&addr, "vendor") {
                Ok(id) => id,
                Err(e) => {
                    warn!("could not read vendor id for device {addr}: {e}");
                    continue;
                }
            };
            if vendor_id != vendor {
                continue;
            }

            let bound_driver = match bus.read_link(&addr, "driver") {
                Ok(name) => name,
                Err(e) => {
                    warn!("could not read driver for device {addr}: {e}");
                    continue;
                }
            };
            if bound_driver != driver {
                // still claimed by its original driver, intentionally not exposed
                debug!("device {addr} is bound to {bound_driver}, skipping");
                continue;
            }

            let group = match bus.read_link(&addr, "iommu_group") {
                Ok(name) => name,
                Err(e) => {
                    warn!("could not read iommu group for device {addr}: {e}");
                    continue;
                }
            };

            if !inventory.iommu_map.contains_key(&group) {
                // first device seen in a group fixes the group's model
                let device_id = match bus.read_id(&addr, "device") {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("could not read device id for device {addr}: {e}");
                        continue;
                    }
                };
                inventory
                    .device_map
                    .entry(device_id)
                    .or_default()
                    .push(group.clone());
            }

            inventory.iommu_map.entry(group).or_default().push(GpuDevice {
                addr,
                index: bus_index,
            });
            bus_index += 1;
        }

        Ok(inventory)
    }

    /// Devices belonging to an IOMMU group; empty for unknown groups.
    pub fn group_devices(&self, group: &str) -> &[GpuDevice] {
        self.iommu_map.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iommu_groups(&self) -> impl Iterator<Item = (&String, &Vec<GpuDevice>)> {
        self.iommu_map.iter()
    }

    /// Device model id to the IOMMU groups advertised under that model.
    pub fn device_models(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.device_map.iter()
    }

    pub fn group_count(&self) -> usize {
        self.iommu_map.len()
    }

    pub fn model_count(&self) -> usize {
        self.device_map.len()
    }

    pub fn device_count(&self) -> usize {
        self.iommu_map.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeBus {
        devices: Vec<String>,
        ids: HashMap<(String, String), String>,
        links: HashMap<(String, String), String>,
        fail_list: bool,
    }

    impl FakeBus {
        fn add(&mut self, addr: &str, vendor: &str, device: &str, driver: &str, group: &str) {
            self.devices.push(addr.to_string());
            self.ids
                .insert((addr.to_string(), "vendor".to_string()), vendor.to_string());
            self.ids
                .insert((addr.to_string(), "device".to_string()), device.to_string());
            self.links
                .insert((addr.to_string(), "driver".to_string()), driver.to_string());
            self.links.insert(
                (addr.to_string(), "iommu_group".to_string()),
                group.to_string(),
            );
        }
    }

    impl BusReader for FakeBus {
        fn list_devices(&self) -> io::Result<Vec<String>> {
            if self.fail_list {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(self.devices.clone())
        }

        fn read_id(&self, addr: &str, property: &str) -> io::Result<String> {
            self.ids
                .get(&(addr.to_string(), property.to_string()))
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such property"))
        }

        fn read_link(&self, addr: &str, link: &str) -> io::Result<String> {
            self.links
                .get(&(addr.to_string(), link.to_string()))
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such link"))
        }
    }

    #[test]
    fn scan_partitions_devices_into_iommu_groups() {
        let mut bus = FakeBus::default();
        bus.add("0000:3d:00.0", "10de", "2204", "vfio-pci", "75");
        bus.add("0000:41:00.0", "10de", "2204", "vfio-pci", "76");
        bus.add("0000:c1:00.0", "10de", "2204", "vfio-pci", "214");
        bus.add("0000:c1:00.1", "10de", "2204", "vfio-pci", "214");

        let inventory =
            Inventory::scan(&bus, NVIDIA_VENDOR_ID, VFIO_DRIVER).expect("scan should succeed");

        assert_eq!(inventory.group_count(), 3, "should find three groups");
        assert_eq!(inventory.device_count(), 4, "should find four devices");
        assert_eq!(
            inventory.group_devices("214").len(),
            2,
            "group 214 should hold both functions of the shared device"
        );

        // every device index is unique and no device appears in two groups
        let mut indexes = HashSet::new();
        let mut addrs = HashSet::new();
        for (_, devices) in inventory.iommu_groups() {
            for dev in devices {
                assert!(indexes.insert(dev.index), "index {} reused", dev.index);
                assert!(addrs.insert(dev.addr.clone()), "device {} reused", dev.addr);
            }
        }
        assert_eq!(indexes.len(), 4, "indexes should cover all devices");
        assert_eq!(
            indexes,
            HashSet::from([0, 1, 2, 3]),
            "indexes should be assigned monotonically from zero"
        );
    }

    #[test]
    fn first_device_in_a_group_fixes_the_model_classification() {
        let mut bus = FakeBus::default();
        // two devices in the same group with different model ids
        bus.add("0000:c1:00.0", "10de", "2204", "vfio-pci", "214");
        bus.add("0000:c1:00.1", "10de", "9999", "vfio-pci", "214");

        let inventory =
            Inventory::scan(&bus, NVIDIA_VENDOR_ID, VFIO_DRIVER).expect("scan should succeed");

        let models: HashMap<_, _> = inventory
            .device_models()
            .map(|(model, groups)| (model.clone(), groups.clone()))
            .collect();
        assert_eq!(
            models.get("2204"),
            Some(&vec!["214".to_string()]),
            "the earlier model should own the group"
        );
        assert!(
            !models.contains_key("9999"),
            "the later model must not be recorded for an already-seen group"
        );
        assert_eq!(
            inventory.group_devices("214").len(),
            2,
            "both devices still land in the group's device list"
        );
    }

    #[test]
    fn scan_skips_other_vendors_and_non_vfio_drivers() {
        let mut bus = FakeBus::default();
        bus.add("0000:00:01.0", "8086", "1234", "i915", "1");
        bus.add("0000:3d:00.0", "10de", "2204", "nvidia", "75");
        bus.add("0000:41:00.0", "10de", "2204", "vfio-pci", "76");

        let inventory =
            Inventory::scan(&bus, NVIDIA_VENDOR_ID, VFIO_DRIVER).expect("scan should succeed");

        assert_eq!(inventory.device_count(), 1, "only the vfio device counts");
        assert_eq!(
            inventory.group_devices("76"),
            &[GpuDevice {
                addr: "0000:41:00.0".to_string(),
                index: 0
            }],
            "the qualifying device keeps index zero"
        );
    }

    #[test]
    fn per_device_read_error_skips_only_that_device() {
        let mut bus = FakeBus::default();
        bus.add("0000:3d:00.0", "10de", "2204", "vfio-pci", "75");
        // device with a missing iommu_group link
        bus.devices.push("0000:41:00.0".to_string());
        bus.ids.insert(
            ("0000:41:00.0".to_string(), "vendor".to_string()),
            "10de".to_string(),
        );
        bus.links.insert(
            ("0000:41:00.0".to_string(), "driver".to_string()),
            "vfio-pci".to_string(),
        );
        bus.add("0000:c1:00.0", "10de", "2204", "vfio-pci", "214");

        let inventory =
            Inventory::scan(&bus, NVIDIA_VENDOR_ID, VFIO_DRIVER).expect("scan should succeed");

        assert_eq!(inventory.device_count(), 2, "broken device is skipped");
        let indexes: HashSet<u32> = inventory
            .iommu_groups()
            .flat_map(|(_, devs)| devs.iter().map(|d| d.index))
            .collect();
        assert_eq!(
            indexes,
            HashSet::from([0, 1]),
            "skipped devices must not consume an index"
        );
    }

    #[test]
    fn walk_error_aborts_the_scan() {
        let bus = FakeBus {
            fail_list: true,
            ..FakeBus::default()
        };
        let result = Inventory::scan(&bus, NVIDIA_VENDOR_ID, VFIO_DRIVER);
        assert!(result.is_err(), "directory walk failure should abort");
    }

    #[test]
    fn empty_bus_yields_empty_inventory() {
        let bus = FakeBus::default();
        let inventory =
            Inventory::scan(&bus, NVIDIA_VENDOR_ID, VFIO_DRIVER).expect("scan should succeed");
        assert_eq!(inventory.model_count(), 0, "no models without devices");
        assert_eq!(inventory.device_count(), 0, "no devices on an empty bus");
    }
}
