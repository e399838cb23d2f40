//! Low-level Docker daemon access (spec.md §4.1).
//!
//! `DockerTransport` is the seam the rest of the engine tests against: a
//! `mockall`-generated mock stands in for the daemon in unit tests, the way
//! the teacher's command layer already mocks its docker interface, while
//! `BollardTransport` is the real implementation used by the service binary.
//! Bound explicitly to the Unix socket rather than
//! `Docker::connect_with_local_defaults()`, because the latter consults
//! `DOCKER_HOST` and a stray/unsupported scheme in that variable must not
//! change where this service talks to (spec.md §4.1).

pub mod helper;
pub mod inspect;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, NetworkingConfig, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::ListImagesOptions;
use bollard::models::HostConfig;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::error::{CoreError, CoreResult};
use inspect::InspectDocument;

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Reserved network names that are refused for both backup and restore
/// (spec.md §6 "Network-backup format").
pub const RESERVED_NETWORK_NAMES: &[&str] =
    &["bridge", "host", "none", "docker_gwbridge", "ingress"];

pub fn is_reserved_network(name: &str) -> bool {
    RESERVED_NETWORK_NAMES.contains(&name)
}

/// The low-level Docker daemon seam. Every method returns a classified
/// [`CoreError`] rather than `bollard`'s own error type so callers above
/// this layer never have to match on a foreign enum (spec.md §4.1 "Failure
/// semantics").
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DockerTransport: Send + Sync {
    async fn ping(&self) -> CoreResult<()>;

    async fn list_containers(&self, all: bool) -> CoreResult<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> CoreResult<InspectDocument>;

    async fn find_container_by_name(&self, name: &str) -> CoreResult<Option<String>>;

    async fn list_images(&self) -> CoreResult<Vec<ImageSummary>>;

    async fn list_volumes(&self) -> CoreResult<Vec<VolumeSummary>>;

    async fn inspect_volume(&self, name: &str) -> CoreResult<Value>;

    async fn volume_exists(&self, name: &str) -> CoreResult<bool>;

    async fn create_volume(&self, name: &str) -> CoreResult<()>;

    async fn list_networks(&self) -> CoreResult<Vec<NetworkSummary>>;

    async fn inspect_network(&self, name: &str) -> CoreResult<Value>;

    async fn network_exists(&self, name: &str) -> CoreResult<bool>;

    async fn create_network(
        &self,
        name: &str,
        subnet: Option<&str>,
        gateway: Option<&str>,
    ) -> CoreResult<()>;

    async fn events(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        filters: HashMap<String, Vec<String>>,
        limit: usize,
    ) -> CoreResult<Vec<Value>>;

    async fn export_image_stream(&self, image_ref: &str, output_path: &Path) -> CoreResult<()>;

    async fn load_image(&self, input_path: &Path) -> CoreResult<()>;

    async fn backup_volume_data(&self, volume_name: &str, output_path: &Path) -> CoreResult<()>;

    async fn restore_volume_data(&self, volume_name: &str, input_path: &Path) -> CoreResult<()>;

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        config: ContainerCreateSpec,
    ) -> CoreResult<String>;

    async fn start_container(&self, id: &str) -> CoreResult<()>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> CoreResult<()>;

    async fn kill_container(&self, id: &str) -> CoreResult<()>;

    async fn remove_container(&self, id: &str, force: bool) -> CoreResult<()>;

    /// Removes any container whose name carries a helper prefix left behind
    /// by a prior crash (spec.md §4.3 invariant).
    async fn sweep_orphaned_helpers(&self) -> CoreResult<usize>;
}

/// Everything the Run-Spec Reconstructor derives, minus the image/name
/// which `create_container` takes as explicit arguments.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateSpec {
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    pub ip_address: Option<String>,
    pub restart_policy: Option<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub port_bindings: Vec<(String, String)>,
    pub tty: bool,
    pub open_stdin: bool,
    pub attached: bool,
}

pub struct BollardTransport {
    client: Docker,
    timeouts: Timeouts,
}

impl BollardTransport {
    pub fn connect(socket_path: &Path, timeouts: Timeouts) -> CoreResult<Self> {
        let client = Docker::connect_with_unix(
            &socket_path.to_string_lossy(),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| CoreError::DockerUnavailable(e.to_string()))?;
        Ok(Self { client, timeouts })
    }

    fn container_name(summary: &bollard::models::ContainerSummary) -> String {
        summary
            .names
            .clone()
            .unwrap_or_default()
            .first()
            .cloned()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string()
    }
}

#[async_trait]
impl DockerTransport for BollardTransport {
    async fn ping(&self) -> CoreResult<()> {
        self.client.ping().await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> CoreResult<Vec<ContainerSummary>> {
        let options = Some(ListContainersOptions::<String> {
            all,
            ..Default::default()
        });
        let containers = self.client.list_containers(options).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.clone().unwrap_or_default(),
                name: Self::container_name(&c),
                image: c.image.clone().unwrap_or_default(),
                status: c.status.clone().unwrap_or_default(),
                labels: c.labels.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> CoreResult<InspectDocument> {
        let details = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let value = serde_json::to_value(details)?;
        Ok(InspectDocument::new(value))
    }

    async fn find_container_by_name(&self, name: &str) -> CoreResult<Option<String>> {
        let containers = self.list_containers(true).await?;
        Ok(containers
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.id))
    }

    async fn list_images(&self) -> CoreResult<Vec<ImageSummary>> {
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        Ok(images
            .into_iter()
            .map(|i| ImageSummary {
                id: i.id,
                repo_tags: i.repo_tags,
            })
            .collect())
    }

    async fn list_volumes(&self) -> CoreResult<Vec<VolumeSummary>> {
        let response = self
            .client
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeSummary {
                name: v.name,
                driver: v.driver,
                mountpoint: v.mountpoint,
            })
            .collect())
    }

    async fn inspect_volume(&self, name: &str) -> CoreResult<Value> {
        let volume = self.client.inspect_volume(name).await?;
        Ok(serde_json::to_value(volume)?)
    }

    async fn volume_exists(&self, name: &str) -> CoreResult<bool> {
        match self.client.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_volume(&self, name: &str) -> CoreResult<()> {
        match self
            .client
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_networks(&self) -> CoreResult<Vec<NetworkSummary>> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_network(&self, name: &str) -> CoreResult<Value> {
        let network = self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(serde_json::to_value(network)?)
    }

    async fn network_exists(&self, name: &str) -> CoreResult<bool> {
        let networks = self.list_networks().await?;
        Ok(networks.iter().any(|n| n.name == name))
    }

    async fn create_network(
        &self,
        name: &str,
        subnet: Option<&str>,
        gateway: Option<&str>,
    ) -> CoreResult<()> {
        let ipam_config = subnet.map(|subnet| {
            vec![bollard::models::IpamConfig {
                subnet: Some(subnet.to_string()),
                gateway: gateway.map(str::to_string),
                ..Default::default()
            }]
        });
        let options = CreateNetworkOptions {
            name: name.to_string(),
            ipam: bollard::models::Ipam {
                config: ipam_config,
                ..Default::default()
            },
            ..Default::default()
        };
        match self.client.create_network(options).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn events(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        filters: HashMap<String, Vec<String>>,
        limit: usize,
    ) -> CoreResult<Vec<Value>> {
        let options = EventsOptions::<String> {
            since: since.map(|s| {
                chrono::DateTime::from_timestamp(s, 0).unwrap_or_default()
            }),
            until: until.map(|u| {
                chrono::DateTime::from_timestamp(u, 0).unwrap_or_default()
            }),
            filters: filters
                .into_iter()
                .collect::<HashMap<String, Vec<String>>>(),
        };
        let mut stream = self.client.events(Some(options));
        let mut out = Vec::new();
        while out.len() < limit {
            match stream.next().await {
                Some(Ok(event)) => {
                    out.push(serde_json::to_value(event)?);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "events stream reported an error; returning partial results");
                    break;
                }
                None => break,
            }
        }
        Ok(out)
    }

    async fn export_image_stream(&self, image_ref: &str, output_path: &Path) -> CoreResult<()> {
        use tokio::process::Command;
        let output_file = std::fs::File::create(output_path)?;
        let status = tokio::time::timeout(
            self.timeouts.image_save(),
            Command::new("docker")
                .args(["save", image_ref])
                .stdout(std::process::Stdio::from(output_file))
                .status(),
        )
        .await
        .map_err(|_| CoreError::Timeout(self.timeouts.image_save()))??;
        if !status.success() {
            return Err(CoreError::Other(format!(
                "docker save exited with {status}"
            )));
        }
        let meta = tokio::fs::metadata(output_path).await?;
        if meta.len() == 0 {
            return Err(CoreError::Other("image export produced an empty file".into()));
        }
        Ok(())
    }

    async fn load_image(&self, input_path: &Path) -> CoreResult<()> {
        let bytes = tokio::fs::read(input_path).await?;
        let mut import_stream = self.client.import_image(
            bollard::image::ImportImageOptions { quiet: true },
            bytes.into(),
            None,
        );
        while let Some(next) = import_stream.next().await {
            next?;
        }
        Ok(())
    }

    async fn backup_volume_data(&self, volume_name: &str, output_path: &Path) -> CoreResult<()> {
        run_helper_pipeline(
            &self.client,
            &self.timeouts,
            helper::BACKUP_HELPER_PREFIX,
            volume_name,
            helper::HELPER_MOUNT_BACKUP,
            PipeDirection::Out(output_path),
        )
        .await
    }

    async fn restore_volume_data(&self, volume_name: &str, input_path: &Path) -> CoreResult<()> {
        run_helper_pipeline(
            &self.client,
            &self.timeouts,
            helper::RESTORE_HELPER_PREFIX,
            volume_name,
            helper::HELPER_MOUNT_RESTORE,
            PipeDirection::In(input_path),
        )
        .await
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        spec: ContainerCreateSpec,
    ) -> CoreResult<String> {
        let port_bindings = if spec.port_bindings.is_empty() {
            None
        } else {
            let mut map: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
                HashMap::new();
            for (container_port, host_port) in &spec.port_bindings {
                map.entry(container_port.clone())
                    .or_insert_with(|| Some(Vec::new()))
                    .get_or_insert_with(Vec::new)
                    .push(bollard::models::PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.clone()),
                    });
            }
            Some(map)
        };

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            network_mode: spec.network_mode.clone(),
            restart_policy: spec.restart_policy.as_ref().map(|name| {
                bollard::models::RestartPolicy {
                    name: Some(restart_policy_name(name)),
                    maximum_retry_count: None,
                }
            }),
            privileged: Some(spec.privileged),
            cap_add: if spec.cap_add.is_empty() {
                None
            } else {
                Some(spec.cap_add.clone())
            },
            cap_drop: if spec.cap_drop.is_empty() {
                None
            } else {
                Some(spec.cap_drop.clone())
            },
            port_bindings,
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(image.to_string()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            entrypoint: if spec.entrypoint.is_empty() {
                None
            } else {
                Some(spec.entrypoint.clone())
            },
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            attach_stdin: Some(spec.attached),
            attach_stdout: Some(spec.attached),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let config = if let (Some(network), Some(ip)) = (&spec.network_mode, &spec.ip_address) {
            let mut endpoints = HashMap::new();
            endpoints.insert(
                network.clone(),
                bollard::models::EndpointSettings {
                    ipam_config: Some(bollard::models::EndpointIpamConfig {
                        ipv4_address: Some(ip.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
            ContainerConfig {
                networking_config: Some(NetworkingConfig {
                    endpoints_config: endpoints,
                }),
                ..config
            }
        } else {
            config
        };

        match self.client.create_container(Some(options), config).await {
            Ok(response) => Ok(response.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // name already in use; caller (Restore Engine) reuses it.
                self.find_container_by_name(name)
                    .await?
                    .ok_or_else(|| CoreError::NameConflict(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn start_container(&self, id: &str) -> CoreResult<()> {
        self.client
            .start_container::<String>(id, None)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> CoreResult<()> {
        self.client
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout_secs as i64,
                }),
            )
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> CoreResult<()> {
        self.client.kill_container::<String>(id, None).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> CoreResult<()> {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_orphaned_helpers(&self) -> CoreResult<usize> {
        let containers = self.list_containers(true).await?;
        let mut swept = 0;
        for container in containers {
            if helper::is_helper_name(&container.name) {
                info!(container = %container.name, "removing orphaned helper container from a prior run");
                self.remove_container(&container.id, true).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

fn restart_policy_name(name: &str) -> bollard::models::RestartPolicyNameEnum {
    use bollard::models::RestartPolicyNameEnum as N;
    match name {
        "always" => N::ALWAYS,
        "unless-stopped" => N::UNLESS_STOPPED,
        "on-failure" => N::ON_FAILURE,
        _ => N::NO,
    }
}

enum PipeDirection<'a> {
    Out(&'a Path),
    In(&'a Path),
}

/// Implements the helper pattern of spec.md §4.3: create a disposable
/// `busybox` container with the named volume bound at `mount_path`, run a
/// `tar` pipeline against it through `docker exec`, and tear the helper
/// down on every exit path (success or error).
async fn run_helper_pipeline(
    client: &Docker,
    timeouts: &Timeouts,
    prefix: &str,
    volume_name: &str,
    mount_path: &str,
    direction: PipeDirection<'_>,
) -> CoreResult<()> {
    let name = helper::helper_name(prefix, volume_name);
    let read_only = matches!(direction, PipeDirection::Out(_));

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}{}",
            volume_name,
            mount_path,
            if read_only { ":ro" } else { "" }
        )]),
        ..Default::default()
    };
    let config = ContainerConfig {
        image: Some(helper::HELPER_IMAGE.to_string()),
        cmd: Some(vec!["sleep".to_string(), "3600".to_string()]),
        host_config: Some(host_config),
        ..Default::default()
    };

    let teardown = |name: String| async move {
        let _ = client
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    };

    let create_result = tokio::time::timeout(
        timeouts.helper_create(),
        client.create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            config,
        ),
    )
    .await
    .map_err(|_| CoreError::Timeout(timeouts.helper_create()))?;

    let container_id = match create_result {
        Ok(response) => response.id,
        Err(e) => return Err(e.into()),
    };

    let start_result = tokio::time::timeout(
        timeouts.helper_create(),
        client.start_container::<String>(&container_id, None),
    )
    .await;
    match start_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            teardown(name).await;
            return Err(e.into());
        }
        Err(_) => {
            teardown(name).await;
            return Err(CoreError::Timeout(timeouts.helper_create()));
        }
    }

    let exec_cmd = match direction {
        PipeDirection::Out(_) => vec!["tar".to_string(), "czf".to_string(), "-".to_string(), "-C".to_string(), mount_path.to_string(), ".".to_string()],
        PipeDirection::In(_) => vec!["tar".to_string(), "xzf".to_string(), "-".to_string(), "-C".to_string(), mount_path.to_string()],
    };

    let result = exec_tar(client, timeouts, &container_id, exec_cmd, &direction).await;

    let _ = client.stop_container(&container_id, None).await;
    teardown(name).await;

    result
}

async fn exec_tar(
    client: &Docker,
    timeouts: &Timeouts,
    container_id: &str,
    cmd: Vec<String>,
    direction: &PipeDirection<'_>,
) -> CoreResult<()> {
    let attach_stdin = matches!(direction, PipeDirection::In(_));
    let exec = tokio::time::timeout(
        timeouts.exec(),
        client.create_exec(
            container_id,
            CreateExecOptions {
                attach_stdin: Some(attach_stdin),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd),
                ..Default::default()
            },
        ),
    )
    .await
    .map_err(|_| CoreError::Timeout(timeouts.exec()))??;

    let start = tokio::time::timeout(
        timeouts.exec(),
        client.start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: false,
                ..Default::default()
            }),
        ),
    )
    .await
    .map_err(|_| CoreError::Timeout(timeouts.exec()))??;

    let transfer = async {
        match start {
            StartExecResults::Attached { mut output, mut input } => match direction {
                PipeDirection::Out(output_path) => {
                    let mut file = tokio::fs::File::create(output_path).await?;
                    while let Some(chunk) = output.next().await {
                        let chunk = chunk?;
                        file.write_all(chunk.into_bytes().as_ref()).await?;
                    }
                    file.flush().await?;
                    Ok(())
                }
                PipeDirection::In(input_path) => {
                    let mut file = tokio::fs::File::open(input_path).await?;
                    let mut buf = Vec::new();
                    file.read_to_end(&mut buf).await?;
                    input.write_all(&buf).await?;
                    input.flush().await?;
                    drop(input);
                    while let Some(chunk) = output.next().await {
                        chunk?;
                    }
                    Ok(())
                }
            },
            StartExecResults::Detached => Err(CoreError::Other(
                "helper exec unexpectedly ran detached".into(),
            )),
        }
    };

    tokio::time::timeout(timeouts.volume_tar(), transfer)
        .await
        .map_err(|_| CoreError::Timeout(timeouts.volume_tar()))?
}
