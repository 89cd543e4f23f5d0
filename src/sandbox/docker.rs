//! Docker implementation of the sandbox driver.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::sandbox::driver::{MountSpec, SandboxDriver, SandboxId, SandboxSpec, SandboxState};
use crate::sandbox::error::{Result, SandboxError};

/// Driver backed by the Docker daemon.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Probe the daemon and return a connected driver.
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }

    /// Check whether an image is present locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Pull an image from its registry.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        use bollard::image::CreateImageOptions;

        tracing::info!(image, "pulling sandbox image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(image, "pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(SandboxError::ImageNotFound {
                        image: format!("{image}: {e}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Ensure an agent image is usable, pulling it when permitted.
    pub async fn ensure_image(&self, image: &str, auto_pull: bool) -> Result<()> {
        if self.image_exists(image).await {
            return Ok(());
        }
        if auto_pull {
            return self.pull_image(image).await;
        }
        Err(SandboxError::ImageNotFound {
            image: image.to_string(),
        })
    }
}

fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

#[async_trait]
impl SandboxDriver for DockerDriver {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mode = if spec.mount.read_only { "ro" } else { "rw" };
        let binds = vec![format!(
            "{}:{}:{}",
            spec.mount.source.display(),
            MountSpec::TARGET,
            mode
        )];

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(spec.memory_limit_bytes as i64),
            nano_cpus: Some((spec.cpu_limit * 1e9) as i64),
            network_mode: Some(spec.network_mode.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec![
                "CHOWN".to_string(),
                "SETUID".to_string(),
                "SETGID".to_string(),
            ]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(MountSpec::TARGET.to_string()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::ImageNotFound {
                    image: spec.image.clone(),
                },
                Some(507) => SandboxError::OutOfResources {
                    reason: e.to_string(),
                },
                _ => SandboxError::CreationFailed {
                    reason: e.to_string(),
                },
            })?;

        Ok(SandboxId(response.id))
    }

    async fn start(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::NotFound {
                    handle: id.to_string(),
                },
                _ => SandboxError::StartFailed {
                    reason: e.to_string(),
                },
            })
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxState> {
        let response = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::NotFound {
                    handle: id.to_string(),
                },
                _ => SandboxError::Docker(e),
            })?;

        let state = response.state.unwrap_or_default();
        let status = state.status.unwrap_or(ContainerStateStatusEnum::EMPTY);
        Ok(match status {
            ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING => {
                SandboxState::Running
            }
            ContainerStateStatusEnum::PAUSED => SandboxState::Paused,
            _ => SandboxState::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            },
        })
    }

    async fn pause(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .pause_container(id.as_str())
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::NotFound {
                    handle: id.to_string(),
                },
                Some(409) => SandboxError::StateInvalid {
                    handle: id.to_string(),
                    operation: "pause",
                },
                _ => SandboxError::Docker(e),
            })
    }

    async fn unpause(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .unpause_container(id.as_str())
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::NotFound {
                    handle: id.to_string(),
                },
                Some(409) => SandboxError::StateInvalid {
                    handle: id.to_string(),
                    operation: "unpause",
                },
                _ => SandboxError::Docker(e),
            })
    }

    async fn kill(&self, id: &SandboxId) -> Result<()> {
        match self
            .docker
            .kill_container(id.as_str(), None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already gone or already stopped: killing a dead sandbox succeeds.
            Err(e) if matches!(status_code(&e), Some(404) | Some(409)) => Ok(()),
            Err(e) => Err(SandboxError::Docker(e)),
        }
    }

    async fn remove(&self, id: &SandboxId) -> Result<()> {
        match self
            .docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(SandboxError::Docker(e)),
        }
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<SandboxId>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name_prefix.to_string()]);

        let options = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter(|c| {
                // Docker's name filter is a substring match; enforce the prefix.
                c.names.as_ref().is_some_and(|names| {
                    names
                        .iter()
                        .any(|n| n.trim_start_matches('/').starts_with(name_prefix))
                })
            })
            .filter_map(|c| c.id.map(SandboxId))
            .collect())
    }

    fn tail_logs(&self, id: &SandboxId) -> BoxStream<'static, String> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id.as_str(), Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        Some(String::from_utf8_lossy(&message).trim_end().to_string())
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!("log tail ended: {}", e);
                        None
                    }
                }
            })
            .boxed()
    }
}

/// Connect to the Docker daemon.
///
/// Tries these locations in order:
/// 1. `DOCKER_HOST` env var (bollard default)
/// 2. `/var/run/docker.sock` (Linux default)
/// 3. `~/.docker/run/docker.sock` (Docker Desktop on macOS)
pub async fn connect_docker() -> Result<Docker> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    if let Some(home) = std::env::var_os("HOME") {
        let desktop_sock = std::path::Path::new(&home).join(".docker/run/docker.sock");
        if desktop_sock.exists() {
            let sock_str = desktop_sock.to_string_lossy();
            if let Ok(docker) =
                Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                return Ok(docker);
            }
        }
    }

    Err(SandboxError::DockerNotAvailable {
        reason: "socket not found: /var/run/docker.sock".to_string(),
    })
}
