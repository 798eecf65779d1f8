//! Drives the device plugin gRPC service over a temporary Unix socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pool_plugin::config::PoolConfig;
use pool_plugin::core::FixedCapacitySampler;
use pool_plugin::core::Health;
use pool_plugin::core::Injection;
use pool_plugin::core::UnitTemplate;
use pool_plugin::platform::k8s::device_plugin::api;
use pool_plugin::platform::k8s::device_plugin::api::device_plugin_client::DevicePluginClient;
use pool_plugin::platform::k8s::device_plugin::api::registration_server::Registration;
use pool_plugin::platform::k8s::device_plugin::api::registration_server::RegistrationServer;
use pool_plugin::platform::k8s::device_plugin::connect_uds;
use pool_plugin::platform::k8s::device_plugin::API_VERSION;
use pool_plugin::platform::k8s::KubeletDevicePlugin;
use pool_plugin::plugin::PoolPlugin;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use test_log::test;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Code;
use tonic::Request;
use tonic::Response;
use tonic::Status;

const UNITS_ENV: &str = "KOVE_POOL_UNITS";

fn config() -> PoolConfig {
    PoolConfig {
        template: UnitTemplate::new(vec![
            Injection::Device {
                host_path: "/dev/kove0".to_string(),
                container_path: "/dev/pool".to_string(),
            },
            Injection::Mount {
                host_path: "/var/lib/pool/{unit}".to_string(),
                container_path: "/pool/{unit}".to_string(),
                read_only: true,
            },
            Injection::Env {
                key: "POOL_UNIT".to_string(),
                value: "{unit}".to_string(),
            },
        ]),
        fixed_units: Some(3),
        refresh_interval: Duration::from_millis(20),
        ..PoolConfig::default()
    }
}

struct Harness {
    _dir: TempDir,
    plugin: Arc<PoolPlugin>,
    server_token: CancellationToken,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
    client: DevicePluginClient<Channel>,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("kove-memory.sock");

        let config = config();
        let plugin = PoolPlugin::new(&config, config.sampler(), CancellationToken::new());
        plugin.start().expect("start publish loop");

        let kubelet_plugin = KubeletDevicePlugin::new(
            "kove-memory.sock".to_string(),
            plugin.clone(),
            UNITS_ENV.to_string(),
        );
        let listener = KubeletDevicePlugin::bind(&socket_path).expect("bind plugin socket");
        let server_token = CancellationToken::new();
        let server = {
            let token = server_token.clone();
            tokio::spawn(async move { kubelet_plugin.serve(listener, token).await })
        };

        let channel = connect_uds(&socket_path).await.expect("connect");
        Self {
            _dir: dir,
            plugin,
            server_token,
            server,
            client: DevicePluginClient::new(channel),
        }
    }

    async fn wait_for_pool(&mut self, count: usize) -> Vec<api::Device> {
        let mut stream = self
            .client
            .list_and_watch(api::Empty {})
            .await
            .expect("list and watch")
            .into_inner();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let response = stream
                    .message()
                    .await
                    .expect("stream error")
                    .expect("stream ended early");
                if response.devices.len() == count {
                    return response.devices;
                }
            }
        })
        .await
        .expect("pool was not published in time")
    }

    async fn shutdown(self) {
        let Self {
            plugin,
            server_token,
            server,
            client,
            ..
        } = self;
        drop(client);

        plugin.stop();
        server_token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok(), "server failed: {result:?}");
    }
}

fn allocate_request(containers: &[&[&str]]) -> api::AllocateRequest {
    api::AllocateRequest {
        container_requests: containers
            .iter()
            .map(|ids| api::ContainerAllocateRequest {
                devices_ids: ids.iter().map(|id| id.to_string()).collect(),
            })
            .collect(),
    }
}

#[test(tokio::test)]
async fn options_are_static() {
    let mut harness = Harness::start().await;

    let options = harness
        .client
        .get_device_plugin_options(api::Empty {})
        .await
        .expect("options")
        .into_inner();
    assert_eq!(
        options,
        api::DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    );

    harness.shutdown().await;
}

#[test(tokio::test)]
async fn list_and_watch_reports_the_pool() {
    let mut harness = Harness::start().await;

    let devices = harness.wait_for_pool(3).await;
    let ids: Vec<String> = devices.iter().map(|device| device.id.clone()).collect();
    assert_eq!(
        ids,
        vec!["pool-0".to_string(), "pool-1".to_string(), "pool-2".to_string()]
    );
    assert!(devices.iter().all(|device| device.health == "Healthy"));

    harness.shutdown().await;
}

#[test(tokio::test)]
async fn allocate_returns_container_instructions() {
    let mut harness = Harness::start().await;
    harness.wait_for_pool(3).await;

    let response = harness
        .client
        .allocate(allocate_request(&[&["pool-2", "pool-0"], &["pool-1"]]))
        .await
        .expect("allocate")
        .into_inner();
    assert_eq!(response.container_responses.len(), 2);

    let first = &response.container_responses[0];
    let devices: Vec<(String, String)> = first
        .devices
        .iter()
        .map(|device| (device.host_path.clone(), device.permissions.clone()))
        .collect();
    assert_eq!(
        devices,
        vec![
            ("/dev/kove0".to_string(), "rw".to_string()),
            ("/dev/kove0".to_string(), "rw".to_string()),
        ]
    );
    let mounts: Vec<String> = first.mounts.iter().map(|m| m.host_path.clone()).collect();
    assert_eq!(
        mounts,
        vec!["/var/lib/pool/pool-2".to_string(), "/var/lib/pool/pool-0".to_string()]
    );
    assert_eq!(
        first.envs.get("POOL_UNIT").map(String::as_str),
        Some("pool-0")
    );
    assert_eq!(
        first.envs.get(UNITS_ENV).map(String::as_str),
        Some("pool-2,pool-0")
    );

    let second = &response.container_responses[1];
    assert_eq!(
        second.envs.get(UNITS_ENV).map(String::as_str),
        Some("pool-1")
    );

    harness.shutdown().await;
}

#[test(tokio::test)]
async fn allocate_errors_map_to_status_codes() {
    let mut harness = Harness::start().await;
    harness.wait_for_pool(3).await;

    let status = harness
        .client
        .allocate(allocate_request(&[&["pool-0", "pool-7"]]))
        .await
        .expect_err("pool-7 does not exist");
    assert_eq!(status.code(), Code::NotFound);
    assert!(status.message().contains("pool-7"));

    harness
        .plugin
        .set_unit_health("pool-1", Health::Unhealthy)
        .expect("pool-1 exists");
    let status = harness
        .client
        .allocate(allocate_request(&[&["pool-1"]]))
        .await
        .expect_err("pool-1 is unhealthy");
    assert_eq!(status.code(), Code::FailedPrecondition);

    let status = harness
        .client
        .allocate(allocate_request(&[&[]]))
        .await
        .expect_err("empty container request");
    assert_eq!(status.code(), Code::InvalidArgument);

    let response = harness
        .client
        .allocate(allocate_request(&[]))
        .await
        .expect("no containers is a valid request")
        .into_inner();
    assert!(response.container_responses.is_empty());

    harness.shutdown().await;
}

#[test(tokio::test)]
async fn preferred_allocation_and_pre_start() {
    let mut harness = Harness::start().await;

    let response = harness
        .client
        .get_preferred_allocation(api::PreferredAllocationRequest {
            container_requests: vec![
                api::ContainerPreferredAllocationRequest {
                    available_device_ids: vec!["pool-0".to_string(), "pool-1".to_string()],
                    must_include_device_ids: Vec::new(),
                    allocation_size: 1,
                },
                api::ContainerPreferredAllocationRequest::default(),
            ],
        })
        .await
        .expect("preferred allocation")
        .into_inner();
    assert_eq!(response.container_responses.len(), 2);
    assert!(response
        .container_responses
        .iter()
        .all(|container| container.device_ids.is_empty()));

    harness
        .client
        .pre_start_container(api::PreStartContainerRequest {
            devices_ids: vec!["pool-0".to_string()],
        })
        .await
        .expect("pre-start");

    harness.shutdown().await;
}

#[test(tokio::test)]
async fn stopped_plugin_reports_unavailable() {
    let mut harness = Harness::start().await;
    harness.plugin.stop();

    let status = harness
        .client
        .allocate(allocate_request(&[&["pool-0"]]))
        .await
        .expect_err("plugin is stopped");
    assert_eq!(status.code(), Code::Unavailable);

    let status = match harness.client.list_and_watch(api::Empty {}).await {
        Ok(_) => panic!("watch must be rejected after stop"),
        Err(status) => status,
    };
    assert_eq!(status.code(), Code::Unavailable);

    harness.shutdown().await;
}

/// Kubelet stand-in recording registrations.
#[derive(Default)]
struct FakeKubelet {
    requests: Mutex<Vec<api::RegisterRequest>>,
    registered: Notify,
}

struct FakeKubeletService(Arc<FakeKubelet>);

#[tonic::async_trait]
impl Registration for FakeKubeletService {
    async fn register(
        &self,
        request: Request<api::RegisterRequest>,
    ) -> Result<Response<api::Empty>, Status> {
        self.0.requests.lock().push(request.into_inner());
        self.0.registered.notify_one();
        Ok(Response::new(api::Empty {}))
    }
}

fn spawn_fake_kubelet(
    socket_path: &Path,
    token: CancellationToken,
) -> (Arc<FakeKubelet>, tokio::task::JoinHandle<()>) {
    let kubelet = Arc::new(FakeKubelet::default());
    let listener = UnixListener::bind(socket_path).expect("bind kubelet socket");
    let service = RegistrationServer::new(FakeKubeletService(kubelet.clone()));
    let handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(listener),
                token.cancelled_owned(),
            )
            .await
            .expect("fake kubelet failed");
    });
    (kubelet, handle)
}

#[test(tokio::test)]
async fn run_registers_and_serves_until_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kubelet_socket = dir.path().join("kubelet.sock");
    let plugin_socket = dir.path().join("kove-memory.sock");

    let kubelet_token = CancellationToken::new();
    let (kubelet, kubelet_task) = spawn_fake_kubelet(&kubelet_socket, kubelet_token.clone());

    let config = config();
    let plugin = PoolPlugin::new(&config, config.sampler(), CancellationToken::new());
    let kubelet_plugin =
        KubeletDevicePlugin::new("kove-memory.sock".to_string(), plugin, UNITS_ENV.to_string());

    let token = CancellationToken::new();
    let run = {
        let kubelet_plugin = kubelet_plugin.clone();
        let plugin_socket = plugin_socket.clone();
        let kubelet_socket = kubelet_socket.clone();
        let token = token.clone();
        tokio::spawn(async move { kubelet_plugin.run(plugin_socket, kubelet_socket, token).await })
    };

    tokio::time::timeout(Duration::from_secs(5), kubelet.registered.notified())
        .await
        .expect("plugin did not register");
    let requests = kubelet.requests.lock().clone();
    assert_eq!(
        requests,
        vec![api::RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: "kove-memory.sock".to_string(),
            resource_name: "kove.net/memory".to_string(),
            options: Some(api::DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }),
        }]
    );

    // the kubelet dials the advertised socket after registration
    let mut client = DevicePluginClient::new(connect_uds(&plugin_socket).await.expect("connect"));
    client
        .get_device_plugin_options(api::Empty {})
        .await
        .expect("options over the registered socket");
    drop(client);

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not stop")
        .expect("run task panicked");
    assert!(result.is_ok(), "run failed: {result:?}");
    assert!(!plugin_socket.exists());

    kubelet_token.cancel();
    kubelet_task.await.expect("fake kubelet panicked");
}

#[test(tokio::test)]
async fn run_fails_without_kubelet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config();
    let plugin = PoolPlugin::new(&config, config.sampler(), CancellationToken::new());
    let kubelet_plugin =
        KubeletDevicePlugin::new("kove-memory.sock".to_string(), plugin, UNITS_ENV.to_string());

    let result = kubelet_plugin
        .run(
            dir.path().join("kove-memory.sock"),
            dir.path().join("kubelet.sock"),
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_err());
}

#[test]
fn fixed_sampler_is_used_for_fixed_units() {
    use pool_plugin::core::CapacitySampler;

    assert_eq!(FixedCapacitySampler::new(3).sample(), 3);
    assert_eq!(config().sampler().sample(), 3);
}
