//! Filesystem-driven health monitoring.
//!
//! Each plugin run spawns one monitor watching two things: the VFIO group
//! character devices it advertised, whose appearance and disappearance become
//! health transitions on the list-and-watch stream, and the plugin's own
//! socket, whose removal means the kubelet restarted and the plugin must
//! re-register.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::plugin::GenericDevicePlugin;

/// What a filesystem event means for the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A watched group device reappeared.
    Healthy(String),
    /// A watched group device went away or was renamed.
    Unhealthy(String),
    /// The kubelet removed the plugin socket; the server must re-register.
    KubeletRestart,
}

/// Watches device paths and the plugin socket for one plugin run.
pub struct HealthMonitor {
    socket_path: PathBuf,
    device_dir: PathBuf,
    path_device_map: HashMap<PathBuf, String>,
}

impl HealthMonitor {
    /// `device_ids` are the advertised IOMMU group ids; each maps to its
    /// character device under `device_dir`.
    pub fn new(device_dir: &Path, socket_path: &Path, device_ids: Vec<String>) -> Self {
        let path_device_map = device_ids
            .into_iter()
            .map(|id| (device_dir.join(&id), id))
            .collect();
        Self {
            socket_path: socket_path.to_path_buf(),
            device_dir: device_dir.to_path_buf(),
            path_device_map,
        }
    }

    /// Maps one notify event to the health transitions it implies.
    fn classify(&self, event: &Event) -> Vec<HealthEvent> {
        let removal = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
        );
        let creation = matches!(event.kind, EventKind::Create(_));
        if !removal && !creation {
            return Vec::new();
        }

        let mut out = Vec::new();
        for path in &event.paths {
            // only an outright removal of the socket means the kubelet
            // restarted and wiped its plugin directory
            if matches!(event.kind, EventKind::Remove(_)) && *path == self.socket_path {
                out.push(HealthEvent::KubeletRestart);
                continue;
            }
            if let Some(id) = self.path_device_map.get(path) {
                if removal {
                    out.push(HealthEvent::Unhealthy(id.clone()));
                } else {
                    out.push(HealthEvent::Healthy(id.clone()));
                }
            }
        }
        out
    }

    /// Runs until the plugin run is cancelled or the kubelet restarts.
    ///
    /// On a kubelet restart the plugin is restarted (which spawns a fresh
    /// monitor) and this one returns.
    pub async fn run(
        self,
        plugin: Arc<GenericDevicePlugin>,
        healthy_tx: mpsc::Sender<String>,
        unhealthy_tx: mpsc::Sender<String>,
        token: CancellationToken,
    ) -> Result<()> {
        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher =
            RecommendedWatcher::new(raw_tx, notify::Config::default()).context("failed to create filesystem watcher")?;

        let socket_dir = self
            .socket_path
            .parent()
            .context("plugin socket path has no parent directory")?;
        watcher
            .watch(socket_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch plugin directory {}", socket_dir.display()))?;

        // watch the directory, not the device nodes themselves: a watch on a
        // node dies with its inode, so a later re-creation would go unseen
        if let Err(e) = watcher.watch(&self.device_dir, RecursiveMode::NonRecursive) {
            warn!(
                "could not watch device directory {}: {e}",
                self.device_dir.display()
            );
        }
        for (path, id) in &self.path_device_map {
            if !path.exists() {
                // a missing group device is already unusable, say so right away
                warn!("device path {} is missing", path.display());
                let _ = unhealthy_tx.send(id.clone()).await;
            }
        }

        // bridge the watcher's blocking channel into the async world
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(16);
        let forwarder = tokio::task::spawn_blocking(move || {
            while let Ok(result) = raw_rx.recv() {
                match result {
                    Ok(event) => {
                        if event_tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("filesystem watch error: {e}"),
                }
            }
        });

        debug!(
            "health monitor for {} watching {} device paths under {}",
            plugin.name(),
            self.path_device_map.len(),
            self.device_dir.display()
        );

        let result = 'watch: loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("health monitor for {} shut down", plugin.name());
                    break 'watch Ok(());
                }
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        break 'watch Ok(());
                    };
                    for health_event in self.classify(&event) {
                        match health_event {
                            HealthEvent::Healthy(id) => {
                                let _ = healthy_tx.send(id).await;
                            }
                            HealthEvent::Unhealthy(id) => {
                                let _ = unhealthy_tx.send(id).await;
                            }
                            HealthEvent::KubeletRestart => {
                                info!(
                                    "kubelet removed socket {}, restarting {} device plugin",
                                    self.socket_path.display(),
                                    plugin.name()
                                );
                                let restart = plugin
                                    .restart()
                                    .await
                                    .context("failed to restart device plugin after kubelet restart");
                                // the restarted run has its own monitor
                                break 'watch restart;
                            }
                        }
                    }
                }
            }
        };

        drop(watcher);
        forwarder.abort();
        result
    }
}
