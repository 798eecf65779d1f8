#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::ContainerPreferredAllocationResponse;
use api::DevicePluginOptions;
use api::DeviceSpec;
use api::Empty;
use api::ListAndWatchResponse;
use api::Mount;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::core::allocation::AllocationRequest;
use crate::core::allocation::ContainerGrant;
use crate::core::allocation::ContainerRequest;
use crate::core::error::AllocationError;
use crate::core::error::PluginError;
use crate::core::types::Injection;
use crate::core::types::Unit;
use crate::plugin::PluginOptions;
use crate::plugin::PoolPlugin;

/// Device plugin API version spoken with the kubelet.
pub const API_VERSION: &str = "v1beta1";

/// Permissions every injected device node gets.
pub const DEVICE_PERMISSIONS: &str = "rw";

/// Kubelet-facing shell around a [`PoolPlugin`]
#[derive(Debug)]
pub struct KubeletDevicePlugin {
    /// socket file name relative to the plugin directory
    endpoint: String,
    plugin: Arc<PoolPlugin>,
    /// env var listing granted units, empty to disable
    allocated_units_env: String,
}

impl KubeletDevicePlugin {
    pub fn new(
        endpoint: String,
        plugin: Arc<PoolPlugin>,
        allocated_units_env: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            plugin,
            allocated_units_env,
        })
    }

    pub fn service(&self) -> DevicePluginService {
        DevicePluginService::new(self.plugin.clone(), self.allocated_units_env.clone())
    }

    /// Binds the plugin socket, replacing a stale socket file.
    pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path).with_context(|| {
                format!("failed to remove stale socket {}", socket_path.display())
            })?;
        }
        UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))
    }

    /// Serves the device plugin service on `listener` until `cancellation_token` fires.
    pub async fn serve(
        &self,
        listener: UnixListener,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<()> {
        let server = DevicePluginServer::new(self.service());

        tonic::transport::Server::builder()
            .add_service(server)
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancellation_token.cancelled().await;
                info!("shutting down gRPC server");
            })
            .await
            .context("device plugin gRPC server failed")
    }

    /// Starts serving on `socket_path`, registers with the kubelet and serves until cancelled.
    pub async fn run(
        self: &Arc<Self>,
        socket_path: PathBuf,
        kubelet_socket: PathBuf,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("start device plugin server: {}", socket_path.display());
        let listener = Self::bind(&socket_path)?;

        let server = {
            let this = self.clone();
            let token = cancellation_token.clone();
            tokio::spawn(async move { this.serve(listener, token).await })
        };

        // the kubelet dials back right after registration, so the server has to be up first
        if let Err(e) = self.register_with_kubelet(&kubelet_socket).await {
            server.abort();
            return Err(e);
        }

        let result = server.await;
        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!("failed to remove plugin socket {}: {e}", socket_path.display());
        }
        result?
    }

    /// register device plugin with kubelet
    pub async fn register_with_kubelet(&self, kubelet_socket: &Path) -> anyhow::Result<()> {
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let channel = connect_uds(kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.plugin.resource_name().to_string(),
            options: Some(to_api_options(self.plugin.options())),
        };

        match client.register(Request::new(request)).await {
            Ok(_) => {
                info!(
                    resource = self.plugin.resource_name(),
                    "successfully registered device plugin with kubelet"
                );
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("registration failed: {e}")),
        }
    }
}

/// Opens a gRPC channel over a Unix domain socket.
pub async fn connect_uds(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since the connector ignores it
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

fn to_api_options(options: PluginOptions) -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: options.pre_start_required,
        get_preferred_allocation_available: options.get_preferred_allocation_available,
    }
}

fn to_api_device(unit: &Unit) -> api::Device {
    api::Device {
        id: unit.id.clone(),
        health: unit.health.to_string(),
        topology: None,
    }
}

/// Builds the kubelet container response; later env entries win over earlier ones.
fn to_container_response(
    grant: ContainerGrant,
    allocated_units_env: &str,
) -> ContainerAllocateResponse {
    let mut envs = HashMap::new();
    let mut mounts = Vec::new();
    let mut devices = Vec::new();

    for injection in grant.injections {
        match injection {
            Injection::Device {
                host_path,
                container_path,
            } => devices.push(DeviceSpec {
                container_path,
                host_path,
                permissions: DEVICE_PERMISSIONS.to_string(),
            }),
            Injection::Mount {
                host_path,
                container_path,
                read_only,
            } => mounts.push(Mount {
                container_path,
                host_path,
                read_only,
            }),
            Injection::Env { key, value } => {
                envs.insert(key, value);
            }
        }
    }

    if !allocated_units_env.is_empty() {
        envs.insert(allocated_units_env.to_string(), grant.unit_ids.join(","));
    }

    ContainerAllocateResponse {
        envs,
        mounts,
        devices,
        annotations: HashMap::new(),
        cdi_devices: Vec::new(),
    }
}

impl From<PluginError> for Status {
    fn from(err: PluginError) -> Self {
        let message = err.to_string();
        match err {
            PluginError::Stopped => Status::unavailable(message),
            PluginError::AlreadyStarted => Status::internal(message),
            PluginError::Allocation(AllocationError::UnknownUnit(_)) => Status::not_found(message),
            PluginError::Allocation(AllocationError::UnhealthyUnit(_)) => {
                Status::failed_precondition(message)
            }
            PluginError::Allocation(AllocationError::EmptyContainerRequest(_)) => {
                Status::invalid_argument(message)
            }
        }
    }
}

/// DevicePlugin service implementation
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    plugin: Arc<PoolPlugin>,
    allocated_units_env: String,
}

impl DevicePluginService {
    pub fn new(plugin: Arc<PoolPlugin>, allocated_units_env: String) -> Self {
        Self {
            plugin,
            allocated_units_env,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(to_api_options(self.plugin.options())))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// list and watch unit set changes
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch unit list");

        let rx = self.plugin.watch().map_err(|e| {
            warn!("rejecting watch: {e}");
            Status::from(e)
        })?;

        let stream = ReceiverStream::new(rx).map(|units| {
            debug!(count = units.len(), "sending unit list to kubelet");
            Ok::<_, Status>(ListAndWatchResponse {
                devices: units.iter().map(to_api_device).collect(),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    /// get preferred unit allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred allocation: {:?}", req);

        let container_responses = self
            .plugin
            .preferred_allocation(req.container_requests.len())?
            .into_iter()
            .map(|device_ids| ContainerPreferredAllocationResponse { device_ids })
            .collect();
        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    /// allocate units to containers
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating units to containers: {:?}", req);

        let request = AllocationRequest {
            containers: req
                .container_requests
                .into_iter()
                .map(|container| ContainerRequest {
                    unit_ids: container.devices_ids,
                })
                .collect(),
        };

        let response = self.plugin.allocate(&request).map_err(|e| {
            error!("allocation failed: {e}");
            Status::from(e)
        })?;

        let container_responses: Vec<_> = response
            .containers
            .into_iter()
            .map(|grant| to_container_response(grant, &self.allocated_units_env))
            .collect();

        info!(
            containers = container_responses.len(),
            "unit allocation completed"
        );
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    /// pre-start container
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        self.plugin.pre_start_container(&req.devices_ids)?;
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
