//! services/grader/src/adapters/docker.rs
//!
//! The `ContainerRuntime` port backed by the local Docker engine through `bollard`.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use grading_core::ports::{ContainerRuntime, ContainerSpec, PortError, PortResult};
use tracing::{debug, info};
use uuid::Uuid;

/// A container runtime adapter that implements the `ContainerRuntime` port.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self, bollard::errors::Error> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }
}

fn unexpected(context: &str, e: bollard::errors::Error) -> PortError {
    PortError::Unexpected(format!("{}: {}", context, e))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> PortResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling sandbox image.");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut progress = self.docker.create_image(options, None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| unexpected("Failed to pull image", e))?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> PortResult<String> {
        let binds = spec
            .mounts
            .iter()
            .map(|dir| format!("{0}:{0}:rw", dir.display()))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.display().to_string()),
            network_disabled: Some(spec.network_disabled),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_limit_bytes),
                memory_swap: Some(spec.memory_limit_bytes),
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("grader-{}", Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| unexpected("Failed to create container", e))?;
        debug!(container = %created.id, %name, "Container created.");
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> PortResult<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| unexpected("Failed to start container", e))
    }

    async fn wait(&self, container_id: &str) -> PortResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit is reported as an error by the engine.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(unexpected("Failed to wait for container", e)),
            None => Err(PortError::Unexpected(format!(
                "Container {} stopped without reporting a status",
                container_id
            ))),
        }
    }

    async fn remove(&self, container_id: &str) -> PortResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| unexpected("Failed to remove container", e))
    }
}
