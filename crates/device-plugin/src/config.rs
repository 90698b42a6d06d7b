use std::path::PathBuf;

use cdi_spec::SpecFormat;
use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(
    name = "xpu-device-plugin",
    about = "Kubernetes device plugin for VFIO-bound GPUs"
)]
pub struct Args {
    #[arg(
        long,
        env = "XPU_PCI_BASE_PATH",
        default_value = "/sys/bus/pci/devices",
        value_hint = clap::ValueHint::DirPath,
        help = "PCI sysfs directory scanned for passthrough devices"
    )]
    pub base_path: PathBuf,

    #[arg(
        long,
        env = "XPU_PCI_IDS_PATH",
        default_value = "/usr/pci.ids",
        value_hint = clap::ValueHint::FilePath,
        help = "pci.ids catalog used to resolve device display names"
    )]
    pub pci_ids_path: PathBuf,

    #[arg(
        long,
        env = "XPU_DEVICE_PLUGIN_DIR",
        default_value = kubelet_api::DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the kubelet watches for device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "XPU_KUBELET_SOCKET",
        default_value = kubelet_api::KUBELET_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        env = "XPU_VFIO_DEVICE_DIR",
        default_value = "/dev/vfio",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the VFIO group character devices"
    )]
    pub vfio_device_dir: PathBuf,

    #[arg(
        long,
        env = "XPU_CDI_DIR",
        default_value = "/var/run/cdi",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the CDI spec document is written to"
    )]
    pub cdi_dir: PathBuf,

    #[arg(
        long,
        env = "XPU_CDI_FORMAT",
        default_value = "yaml",
        value_parser = parse_spec_format,
        help = "Serialization format for the CDI spec document, 'yaml' or 'json'"
    )]
    pub cdi_format: SpecFormat,

    #[arg(
        long,
        env = "XPU_CDI_ANNOTATION_PREFIX",
        default_value = cdi_spec::ANNOTATION_PREFIX,
        help = "Annotation key prefix used when the cdi-annotations strategy is enabled"
    )]
    pub cdi_annotation_prefix: String,

    #[arg(
        long,
        help = "Pass allocated devices to the runtime through CDI annotations",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub cdi_annotations: bool,

    #[arg(
        long,
        help = "Pass allocated devices to the runtime through structured CRI CDI device handles",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub cdi_cri: bool,
}

/// Parse a CDI spec format name from the command line.
fn parse_spec_format(s: &str) -> Result<SpecFormat, String> {
    s.parse::<SpecFormat>().map_err(|e| e.to_string())
}
