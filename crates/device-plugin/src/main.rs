use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use xpu_device_plugin::catalog;
use xpu_device_plugin::cdi_writer;
use xpu_device_plugin::config::Args;
use xpu_device_plugin::discovery::{BusReader, Inventory, SysfsBusReader, NVIDIA_VENDOR_ID, VFIO_DRIVER};
use xpu_device_plugin::logging;
use xpu_device_plugin::plugin::{GenericDevicePlugin, KubeletRegistrar, PluginConfig, Registrar};
use xpu_device_plugin::response::DeviceListStrategies;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init();
    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let bus = Arc::new(SysfsBusReader::new(&args.base_path));
    let inventory = Arc::new(
        Inventory::scan(bus.as_ref(), NVIDIA_VENDOR_ID, VFIO_DRIVER)
            .context("device discovery failed")?,
    );
    info!(
        "discovered {} passthrough GPUs in {} IOMMU groups across {} models",
        inventory.device_count(),
        inventory.group_count(),
        inventory.model_count()
    );

    // best effort, the plugin servers work from the in-memory inventory
    match cdi_writer::write(&inventory, &args.cdi_dir, args.cdi_format) {
        Ok(path) => info!("wrote CDI spec document to {}", path.display()),
        Err(e) => warn!("could not write CDI spec document: {e}"),
    }

    let registrar: Arc<dyn Registrar> = Arc::new(KubeletRegistrar::new(&args.kubelet_socket));
    let strategies = DeviceListStrategies::new(args.cdi_annotations, args.cdi_cri);

    let mut plugins = Vec::new();
    for (model_id, groups) in inventory.device_models() {
        let name = catalog::device_name(&args.pci_ids_path, NVIDIA_VENDOR_ID, model_id)
            .unwrap_or_else(|| catalog::sanitize_resource_name(model_id));

        let plugin = GenericDevicePlugin::new(
            PluginConfig {
                name,
                plugin_dir: args.device_plugin_dir.clone(),
                device_dir: args.vfio_device_dir.clone(),
                vendor: NVIDIA_VENDOR_ID.to_string(),
                strategies: strategies.clone(),
                cdi_annotation_prefix: args.cdi_annotation_prefix.clone(),
            },
            groups,
            Arc::clone(&inventory),
            Arc::clone(&bus) as Arc<dyn BusReader>,
            Arc::clone(&registrar),
            shutdown.clone(),
        );

        // one failing model must not take down the others
        if let Err(e) = plugin.start().await {
            error!("failed to start device plugin {}: {e:#}", plugin.name());
            continue;
        }
        plugins.push(plugin);
    }

    if plugins.is_empty() {
        warn!("no device plugin servers running");
    }

    shutdown.cancelled().await;

    for plugin in &plugins {
        if let Err(e) = plugin.stop().await {
            warn!("failed to stop device plugin {}: {e:#}", plugin.name());
        }
    }
    info!("all device plugin servers stopped");
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                token.cancel();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = term.recv() => info!("received SIGTERM, shutting down"),
        }
        token.cancel();
    });
}
