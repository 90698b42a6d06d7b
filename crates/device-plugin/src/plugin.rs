//! The per-model device plugin server: registration with the kubelet,
//! the device plugin gRPC service, and the start/stop/restart lifecycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use kubelet_api::device_plugin::v1beta1::{
    device_plugin_server::{DevicePlugin, DevicePluginServer},
    registration_client::RegistrationClient,
    AllocateRequest, AllocateResponse, Device, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse, RegisterRequest,
};
use kubelet_api::{API_VERSION, HEALTHY, UNHEALTHY};

use crate::discovery::{BusReader, GpuDevice, Inventory};
use crate::health::HealthMonitor;
use crate::response::{DeviceListStrategies, ResponseBuilder};

/// Namespace half of the advertised resource name.
pub const DEVICE_PLUGIN_NAMESPACE: &str = "nvidia.com";

/// Environment variable asserting the CDI vendor/class consumed by the
/// container runtime.
pub const K8S_CDI_VENDOR_CLASS_ENV: &str = "KUBERNETES_CDI_VENDOR_CLASS";

/// Value of [`K8S_CDI_VENDOR_CLASS_ENV`] in every allocate response.
pub const CDI_VENDOR_CLASS: &str = "nvidia.com/gpu";

/// Bound on socket connectivity checks and the registration call.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Registration half of the device plugin protocol, injected so tests can
/// substitute the kubelet.
#[async_trait::async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, endpoint: &str, resource_name: &str) -> Result<()>;
}

/// [`Registrar`] dialing the kubelet's registration socket.
pub struct KubeletRegistrar {
    socket: PathBuf,
}

impl KubeletRegistrar {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait::async_trait]
impl Registrar for KubeletRegistrar {
    async fn register(&self, endpoint: &str, resource_name: &str) -> Result<()> {
        let channel = connect_uds(&self.socket, CONNECTION_TIMEOUT)
            .await
            .context("failed to dial kubelet registration socket")?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: endpoint.to_string(),
            resource_name: resource_name.to_string(),
            options: None,
        };

        tokio::time::timeout(CONNECTION_TIMEOUT, client.register(request))
            .await
            .context("kubelet registration call timed out")?
            .context("kubelet registration call failed")?;

        Ok(())
    }
}

/// Opens a gRPC channel over a unix socket, bounded by `timeout`.
pub(crate) async fn connect_uds(path: &Path, timeout: Duration) -> Result<Channel> {
    let path = path.to_path_buf();
    // The endpoint URI is mandatory but never resolved; the connector dials
    // the socket directly.
    let endpoint = Endpoint::try_from("http://[::]:50051")?;
    let connecting = endpoint.connect_with_connector(
        tower::service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
                    UnixStream::connect(path).await?,
                ))
            }
        }),
    );

    let channel = tokio::time::timeout(timeout, connecting)
        .await
        .context("timed out dialing unix socket")??;
    Ok(channel)
}

async fn wait_for_server(socket: &Path, timeout: Duration) -> Result<()> {
    let channel = connect_uds(socket, timeout).await?;
    drop(channel);
    Ok(())
}

/// Health transition receivers owned by the active list-and-watch session.
struct WatchChannels {
    healthy: mpsc::Receiver<String>,
    unhealthy: mpsc::Receiver<String>,
    term: mpsc::Receiver<()>,
}

/// Implementation of the device plugin gRPC service. Cheap to clone; all
/// state is shared with the owning [`GenericDevicePlugin`].
#[derive(Clone)]
struct PluginService {
    name: String,
    vendor: String,
    devices: Arc<Mutex<Vec<Device>>>,
    inventory: Arc<Inventory>,
    bus: Arc<dyn BusReader>,
    builder: Arc<ResponseBuilder>,
    channels: Arc<tokio::sync::Mutex<WatchChannels>>,
    // token of the current run, swapped on every (re)start
    run_token: Arc<Mutex<CancellationToken>>,
}

fn update_health(devices: &Arc<Mutex<Vec<Device>>>, id: &str, health: &str) -> Vec<Device> {
    let mut devices = devices.lock().expect("device list lock poisoned");
    for dev in devices.iter_mut() {
        if dev.id == id {
            dev.health = health.to_string();
        }
    }
    devices.clone()
}

fn unknown_device(addr: &str) -> Status {
    Status::invalid_argument(format!("invalid allocation request: unknown device: {addr}"))
}

impl PluginService {
    /// Re-checks a device against the live bus before allocation. A changed
    /// IOMMU group or vendor means the topology moved underneath us since
    /// discovery and the device must not be handed out.
    fn validate_device(&self, dev: &GpuDevice, group: &str) -> std::result::Result<(), Status> {
        match self.bus.read_link(&dev.addr, "iommu_group") {
            Ok(live_group) if live_group == group => {}
            _ => {
                warn!("iommu group has changed on the system for device {}", dev.addr);
                return Err(unknown_device(&dev.addr));
            }
        }
        match self.bus.read_id(&dev.addr, "vendor") {
            Ok(live_vendor) if live_vendor == self.vendor => {}
            _ => {
                warn!("vendor has changed on the system for device {}", dev.addr);
                return Err(unknown_device(&dev.addr));
            }
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    type ListAndWatchStream = ReceiverStream<std::result::Result<ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!("[{}] list-and-watch session opened", self.name);
        let (tx, rx) = mpsc::channel(4);
        let devices = Arc::clone(&self.devices);
        let channels = Arc::clone(&self.channels);
        let stop = self
            .run_token
            .lock()
            .expect("run token lock poisoned")
            .clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            // the session is the single consumer of health transitions
            let mut channels = channels.lock_owned().await;
            let WatchChannels {
                healthy,
                unhealthy,
                term,
            } = &mut *channels;

            let snapshot = devices.lock().expect("device list lock poisoned").clone();
            if tx
                .send(Ok(ListAndWatchResponse { devices: snapshot }))
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    Some(id) = unhealthy.recv() => {
                        warn!("[{name}] marking device {id} unhealthy");
                        let snapshot = update_health(&devices, &id, UNHEALTHY);
                        if tx.send(Ok(ListAndWatchResponse { devices: snapshot })).await.is_err() {
                            break;
                        }
                    }
                    Some(id) = healthy.recv() => {
                        info!("[{name}] marking device {id} healthy");
                        let snapshot = update_health(&devices, &id, HEALTHY);
                        if tx.send(Ok(ListAndWatchResponse { devices: snapshot })).await.is_err() {
                            break;
                        }
                    }
                    _ = term.recv() => {
                        debug!("[{name}] list-and-watch session ending for server stop");
                        break;
                    }
                    _ = stop.cancelled() => {
                        debug!("[{name}] list-and-watch session shut down");
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let requests = request.into_inner();
        let mut responses = AllocateResponse::default();

        for container_request in &requests.container_requests {
            let mut device_indexes = Vec::new();
            for group in &container_request.devices_ids {
                // fresh inventory lookup plus a live bus re-read, never the
                // cached advertised list
                for dev in self.inventory.group_devices(group) {
                    self.validate_device(dev, group)?;
                    device_indexes.push(dev.index);
                }
            }

            let mut response = self.builder.build(&device_indexes).map_err(|e| {
                Status::internal(format!("failed to build allocate response: {e:#}"))
            })?;
            response.envs = HashMap::from([(
                K8S_CDI_VENDOR_CLASS_ENV.to_string(),
                CDI_VENDOR_CLASS.to_string(),
            )]);
            responses.container_responses.push(response);
        }

        Ok(Response::new(responses))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> std::result::Result<Response<PreferredAllocationResponse>, Status> {
        // not implemented; an empty response keeps probing kubelets happy
        Ok(Response::new(PreferredAllocationResponse::default()))
    }
}

/// Construction parameters for a [`GenericDevicePlugin`].
pub struct PluginConfig {
    /// Display name of the device model, used in the resource name and the
    /// socket file name.
    pub name: String,
    /// Directory the kubelet watches for plugin sockets.
    pub plugin_dir: PathBuf,
    /// Directory holding the VFIO group character devices.
    pub device_dir: PathBuf,
    /// Vendor id devices must still report at allocation time.
    pub vendor: String,
    pub strategies: DeviceListStrategies,
    pub cdi_annotation_prefix: String,
}

struct RunHandle {
    token: CancellationToken,
    server: JoinHandle<()>,
}

/// One device plugin server instance per device model found on the node.
pub struct GenericDevicePlugin {
    name: String,
    socket_path: PathBuf,
    device_dir: PathBuf,
    service: PluginService,
    healthy_tx: mpsc::Sender<String>,
    unhealthy_tx: mpsc::Sender<String>,
    term_tx: mpsc::Sender<()>,
    root: CancellationToken,
    run: tokio::sync::Mutex<Option<RunHandle>>,
    registrar: Arc<dyn Registrar>,
}

impl GenericDevicePlugin {
    /// Builds a plugin advertising one allocatable unit per IOMMU group in
    /// `groups`, initially healthy. `shutdown` is the process-wide signal;
    /// every run of this plugin uses its own child token of it.
    pub fn new(
        config: PluginConfig,
        groups: &[String],
        inventory: Arc<Inventory>,
        bus: Arc<dyn BusReader>,
        registrar: Arc<dyn Registrar>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let socket_path = config.plugin_dir.join(format!("xpu-{}.sock", config.name));

        let devices = groups
            .iter()
            .map(|id| Device {
                id: id.clone(),
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect::<Vec<_>>();

        let (healthy_tx, healthy_rx) = mpsc::channel(16);
        let (unhealthy_tx, unhealthy_rx) = mpsc::channel(16);
        let (term_tx, term_rx) = mpsc::channel(1);

        let service = PluginService {
            name: config.name.clone(),
            vendor: config.vendor,
            devices: Arc::new(Mutex::new(devices)),
            inventory,
            bus,
            builder: Arc::new(ResponseBuilder::new(
                config.strategies,
                config.cdi_annotation_prefix,
            )),
            channels: Arc::new(tokio::sync::Mutex::new(WatchChannels {
                healthy: healthy_rx,
                unhealthy: unhealthy_rx,
                term: term_rx,
            })),
            run_token: Arc::new(Mutex::new(shutdown.child_token())),
        };

        Arc::new(Self {
            name: config.name,
            socket_path,
            device_dir: config.device_dir,
            service,
            healthy_tx,
            unhealthy_tx,
            term_tx,
            root: shutdown,
            run: tokio::sync::Mutex::new(None),
            registrar,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    fn device_ids(&self) -> Vec<String> {
        self.service
            .devices
            .lock()
            .expect("device list lock poisoned")
            .iter()
            .map(|dev| dev.id.clone())
            .collect()
    }

    /// Binds the plugin socket, serves in the background, registers with the
    /// kubelet and spawns the health monitor. Fails if already running; on a
    /// registration or connectivity failure the just-started server is torn
    /// down again before the error is returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            bail!("device plugin server for {} already started", self.name);
        }

        self.cleanup()
            .context("failed to remove stale plugin socket")?;

        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!(
                "failed to bind device plugin socket {}",
                self.socket_path.display()
            )
        })?;

        let token = self.root.child_token();
        *self
            .service
            .run_token
            .lock()
            .expect("run token lock poisoned") = token.clone();

        let incoming = UnixListenerStream::new(listener);
        let service = DevicePluginServer::new(self.service.clone());
        let shutdown = token.clone();
        let name = self.name.clone();
        let server = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!("[{name}] device plugin server exited with error: {e}");
            }
        });

        let teardown = |server: JoinHandle<()>| {
            token.cancel();
            server.abort();
            let _ = self.cleanup();
        };

        if let Err(e) = wait_for_server(&self.socket_path, CONNECTION_TIMEOUT).await {
            warn!("[{}] error connecting to plugin server: {e:#}", self.name);
            teardown(server);
            return Err(e).context("device plugin server did not become connectable");
        }

        if let Err(e) = self.register().await {
            warn!(
                "[{}] error registering with device plugin manager: {e:#}",
                self.name
            );
            teardown(server);
            return Err(e);
        }

        let monitor = HealthMonitor::new(&self.device_dir, &self.socket_path, self.device_ids());
        let plugin = Arc::clone(self);
        let healthy_tx = self.healthy_tx.clone();
        let unhealthy_tx = self.unhealthy_tx.clone();
        let monitor_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor
                .run(plugin, healthy_tx, unhealthy_tx, monitor_token)
                .await
            {
                error!("health monitor failed: {e:#}");
            }
        });

        *run = Some(RunHandle { token, server });
        info!("{} device plugin server ready", self.name);
        Ok(())
    }

    /// Registers this plugin's endpoint and resource name with the kubelet.
    async fn register(&self) -> Result<()> {
        let endpoint = self
            .socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("plugin socket path has no file name")?;
        let resource_name = format!("{DEVICE_PLUGIN_NAMESPACE}/{}", self.name);
        self.registrar.register(&endpoint, &resource_name).await
    }

    /// Stops the server and removes the socket. A no-op when not running.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.run.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        info!("stopping {} device plugin server", self.name);
        // end an active list-and-watch session, then the serve loop
        let _ = self.term_tx.try_send(());
        handle.token.cancel();
        if let Err(e) = handle.server.await {
            warn!(
                "device plugin server task for {} did not stop cleanly: {e}",
                self.name
            );
        }

        self.cleanup()
    }

    /// Stop followed by start with a fresh run token. Only invoked by the
    /// health monitor when the kubelet removed this plugin's socket.
    // Returns a boxed future so the recursion through the health monitor
    // (start -> monitor -> restart -> start) has a non-opaque `Send` future.
    pub fn restart(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'static>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            info!("restarting {} device plugin server", this.name);
            if this.run.lock().await.is_none() {
                bail!("no running server instance found for {}", this.name);
            }

            this.stop().await?;
            this.start().await
        })
    }

    /// Removes the plugin socket if present.
    fn cleanup(&self) -> Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "failed to remove plugin socket {}",
                    self.socket_path.display()
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{NVIDIA_VENDOR_ID, VFIO_DRIVER};
    use kubelet_api::ContainerAllocateRequest;
    use std::io;

    /// Single 10de/2204 device in group 214, optionally reporting a moved
    /// group or foreign vendor at allocation time.
    struct ScenarioBus {
        live_group: &'static str,
        live_vendor: &'static str,
    }

    impl Default for ScenarioBus {
        fn default() -> Self {
            Self {
                live_group: "214",
                live_vendor: NVIDIA_VENDOR_ID,
            }
        }
    }

    impl BusReader for ScenarioBus {
        fn list_devices(&self) -> io::Result<Vec<String>> {
            Ok(vec!["0000:c1:00.0".to_string()])
        }

        fn read_id(&self, _addr: &str, property: &str) -> io::Result<String> {
            match property {
                "vendor" => Ok(self.live_vendor.to_string()),
                "device" => Ok("2204".to_string()),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such property")),
            }
        }

        fn read_link(&self, _addr: &str, link: &str) -> io::Result<String> {
            match link {
                "driver" => Ok(VFIO_DRIVER.to_string()),
                "iommu_group" => Ok(self.live_group.to_string()),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such link")),
            }
        }
    }

    struct NoopRegistrar;

    #[async_trait::async_trait]
    impl Registrar for NoopRegistrar {
        async fn register(&self, _endpoint: &str, _resource_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn plugin_with_bus(bus: ScenarioBus) -> Arc<GenericDevicePlugin> {
        // discover with a healthy bus so the inventory matches the scenario
        let inventory = Arc::new(
            Inventory::scan(&ScenarioBus::default(), NVIDIA_VENDOR_ID, VFIO_DRIVER)
                .expect("scan should succeed"),
        );
        GenericDevicePlugin::new(
            PluginConfig {
                name: "TEST_GPU".to_string(),
                plugin_dir: PathBuf::from("/tmp"),
                device_dir: PathBuf::from("/dev/vfio"),
                vendor: NVIDIA_VENDOR_ID.to_string(),
                strategies: DeviceListStrategies::new(true, true),
                cdi_annotation_prefix: cdi_spec::ANNOTATION_PREFIX.to_string(),
            },
            &["214".to_string()],
            inventory,
            Arc::new(bus),
            Arc::new(NoopRegistrar),
            CancellationToken::new(),
        )
    }

    fn allocate_request(device_ids: &[&str]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: device_ids.iter().map(|id| id.to_string()).collect(),
            }],
        })
    }

    #[tokio::test]
    async fn allocate_produces_cdi_handle_annotation_and_env() {
        let plugin = plugin_with_bus(ScenarioBus::default());

        let response = plugin
            .service
            .allocate(allocate_request(&["214"]))
            .await
            .expect("allocate should succeed")
            .into_inner();

        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        assert_eq!(
            container.cdi_devices,
            vec![kubelet_api::CdiDevice {
                name: "nvidia.com/gpu=0".to_string()
            }],
            "device handle should name the qualified index-0 device"
        );
        let (key, value) = container
            .annotations
            .iter()
            .next()
            .expect("annotation strategy is enabled");
        assert!(
            key.starts_with(cdi_spec::ANNOTATION_PREFIX),
            "annotation key should sit under the configured prefix, got {key}"
        );
        assert_eq!(value, "nvidia.com/gpu=0");
        assert_eq!(
            container.envs.get(K8S_CDI_VENDOR_CLASS_ENV),
            Some(&CDI_VENDOR_CLASS.to_string()),
            "vendor/class env var should always be set"
        );
    }

    #[tokio::test]
    async fn allocate_rejects_a_moved_iommu_group() {
        let plugin = plugin_with_bus(ScenarioBus {
            live_group: "999",
            ..ScenarioBus::default()
        });

        let status = plugin
            .service
            .allocate(allocate_request(&["214"]))
            .await
            .expect_err("allocate should fail on a moved group");
        assert!(
            status.message().contains("unknown device: 0000:c1:00.0"),
            "error should identify the offending device, got {}",
            status.message()
        );

        // advertised list untouched
        let devices = plugin.service.devices.lock().expect("lock").clone();
        assert_eq!(devices[0].health, HEALTHY, "health state must not change");
    }

    #[tokio::test]
    async fn allocate_rejects_a_changed_vendor() {
        let plugin = plugin_with_bus(ScenarioBus {
            live_vendor: "8086",
            ..ScenarioBus::default()
        });

        let status = plugin
            .service
            .allocate(allocate_request(&["214"]))
            .await
            .expect_err("allocate should fail on a changed vendor");
        assert!(
            status.message().contains("unknown device"),
            "error should report an unknown device, got {}",
            status.message()
        );
    }

    #[tokio::test]
    async fn allocate_with_empty_device_list_is_not_an_error() {
        let plugin = plugin_with_bus(ScenarioBus::default());

        let response = plugin
            .service
            .allocate(allocate_request(&[]))
            .await
            .expect("empty allocate should succeed")
            .into_inner();

        let container = &response.container_responses[0];
        assert!(container.annotations.is_empty(), "no annotations expected");
        assert!(container.cdi_devices.is_empty(), "no handles expected");
        assert_eq!(
            container.envs.get(K8S_CDI_VENDOR_CLASS_ENV),
            Some(&CDI_VENDOR_CLASS.to_string()),
            "env var is set even for empty requests"
        );
    }

    #[tokio::test]
    async fn options_report_no_prestart_and_no_preferred_allocation() {
        let plugin = plugin_with_bus(ScenarioBus::default());

        let options = plugin
            .service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("options call should succeed")
            .into_inner();
        assert!(!options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);

        let preferred = plugin
            .service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .expect("preferred allocation should not error")
            .into_inner();
        assert!(
            preferred.container_responses.is_empty(),
            "unimplemented hint should be an empty response"
        );
    }

    async fn next_health(
        stream: &mut ReceiverStream<std::result::Result<ListAndWatchResponse, Status>>,
    ) -> String {
        use tokio_stream::StreamExt;

        let update = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("device list update should arrive promptly")
            .expect("stream should stay open")
            .expect("stream should carry a device list");
        update.devices[0].health.clone()
    }

    #[tokio::test]
    async fn repeated_healthy_signals_keep_the_device_healthy() {
        let plugin = plugin_with_bus(ScenarioBus::default());
        let mut stream = plugin
            .service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("list-and-watch should open")
            .into_inner();

        assert_eq!(
            next_health(&mut stream).await,
            HEALTHY,
            "device starts healthy"
        );

        plugin
            .unhealthy_tx
            .send("214".to_string())
            .await
            .expect("unhealthy signal should send");
        assert_eq!(
            next_health(&mut stream).await,
            UNHEALTHY,
            "removal flips to unhealthy"
        );

        // two consecutive healthy signals, e.g. a device node recreated and
        // touched again, both leave the device healthy
        plugin
            .healthy_tx
            .send("214".to_string())
            .await
            .expect("healthy signal should send");
        assert_eq!(
            next_health(&mut stream).await,
            HEALTHY,
            "device recovers to healthy"
        );

        plugin
            .healthy_tx
            .send("214".to_string())
            .await
            .expect("repeated healthy signal should send");
        assert_eq!(
            next_health(&mut stream).await,
            HEALTHY,
            "a repeated healthy signal must not change the advertised state"
        );
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let plugin = plugin_with_bus(ScenarioBus::default());
        plugin.stop().await.expect("stop should be a no-op");
        assert!(!plugin.is_running().await);
    }

    #[tokio::test]
    async fn restart_without_start_is_rejected() {
        let plugin = plugin_with_bus(ScenarioBus::default());
        let err = plugin
            .restart()
            .await
            .expect_err("restart without a running server should fail");
        assert!(
            err.to_string().contains("no running server instance"),
            "error should name the missing instance, got {err:#}"
        );
    }
}
