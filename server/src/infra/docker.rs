//! Container engine layer

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions},
    models::{HostConfig, PortBinding},
    network::{CreateNetworkOptions, InspectNetworkOptions},
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker,
};
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info};

use crate::domain::environment::{CommandResult, LogOptions, LogStream};
use crate::error::{Error, Result};

/// Container creation options
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOpts {
    /// Container name
    pub name: String,
    /// Image to use
    pub image: String,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Named volumes to mount (volume name -> container path)
    pub volumes: HashMap<String, String>,
    /// Command to run; the image default when unset
    pub cmd: Option<Vec<String>>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Network to attach to
    pub network: Option<String>,
    /// Memory limit in bytes
    pub memory_limit: Option<i64>,
    /// CPU limit in units of 1e-9 CPUs
    pub nano_cpus: Option<i64>,
    /// Container ports published on ephemeral host ports
    pub ports: Vec<u16>,
    pub privileged: bool,
}

/// Subset of container inspection used for status and endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspection {
    pub running: bool,
    /// Declared health-check status ("healthy", "unhealthy", "starting")
    pub health: Option<String>,
    /// "8080/tcp" -> "0.0.0.0:49153"
    pub ports: HashMap<String, String>,
}

/// Operations the container backend needs from an engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;
    /// Returns the network identifier used by later calls
    async fn create_network(&self, name: &str, labels: HashMap<String, String>) -> Result<String>;
    /// Missing networks are not an error
    async fn remove_network(&self, id: &str) -> Result<()>;
    /// Ids of containers attached to the network
    async fn network_containers(&self, id: &str) -> Result<Vec<String>>;
    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<String>;
    /// Missing volumes are not an error
    async fn remove_volume(&self, name: &str) -> Result<()>;
    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Force-removes; missing containers are not an error
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspection>;
    async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        env: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandResult>;
    async fn logs(&self, id: &str, options: &LogOptions) -> Result<String>;
    async fn follow_logs(&self, id: &str, options: &LogOptions) -> Result<LogStream>;
    async fn build_image(&self, tag: &str, dockerfile: &str) -> Result<()>;
    /// Force-removes; missing images are not an error
    async fn remove_image(&self, tag: &str) -> Result<()>;
}

/// Docker engine accessed through the daemon API
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Create a new Docker engine client
    pub fn new(socket_path: Option<&str>) -> Result<Self> {
        let client = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| Error::DockerError(e.to_string()))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| Error::DockerError(e.to_string()))?,
        };

        Ok(Self { client })
    }

    /// Pull an image if not present
    async fn ensure_image(&self, image: &str) -> Result<()> {
        let image_name = if image.contains(':') {
            image.to_string()
        } else {
            format!("{}:latest", image)
        };

        if self.client.inspect_image(&image_name).await.is_ok() {
            debug!("Image {} already exists", image_name);
            return Ok(());
        }

        info!("Pulling image {}...", image_name);
        let options = CreateImageOptions {
            from_image: image_name.clone(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::DockerError(format!("Failed to pull image: {}", e)));
                }
            }
        }

        info!("Image {} pulled successfully", image_name);
        Ok(())
    }

    fn logs_options(options: &LogOptions, follow: bool) -> LogsOptions<String> {
        LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            tail: options
                .tail
                .map(|t| t.to_string())
                .unwrap_or_else(|| "all".to_string()),
            since: options
                .since
                .as_deref()
                .and_then(parse_since)
                .map(|ago| Utc::now().timestamp() - ago.as_secs() as i64)
                .unwrap_or(0),
            ..Default::default()
        }
    }
}

/// Treat 404 from the daemon as success
fn ignore_missing(result: std::result::Result<(), bollard::errors::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Raw output bytes, decoded once so multibyte characters may span chunks
#[derive(Default)]
struct OutputBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl OutputBuffer {
    fn push(&mut self, output: LogOutput) {
        match output {
            LogOutput::StdOut { message } => self.stdout.extend_from_slice(&message),
            LogOutput::StdErr { message } => self.stderr.extend_from_slice(&message),
            _ => {}
        }
    }

    fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

fn log_text(output: LogOutput) -> String {
    match output {
        LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
            String::from_utf8_lossy(&message).to_string()
        }
        _ => String::new(),
    }
}

/// Relative duration such as "30s", "10m" or "2h"
pub fn parse_since(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let unit = raw.chars().last()?;
    let value: u64 = raw[..raw.len() - unit.len_utf8()].parse().ok()?;
    let secs = match unit {
        's' => value,
        'm' => value * 60,
        'h' => value * 3600,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| Error::DockerError(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }

    async fn create_network(&self, name: &str, labels: HashMap<String, String>) -> Result<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            labels,
            ..Default::default()
        };

        self.client
            .create_network(options)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create network: {}", e)))?;

        info!("Network {} created", name);
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        ignore_missing(self.client.remove_network(id).await)?;
        info!("Network {} removed", id);
        Ok(())
    }

    async fn network_containers(&self, id: &str) -> Result<Vec<String>> {
        let network = self
            .client
            .inspect_network(id, None::<InspectNetworkOptions<String>>)
            .await?;

        Ok(network
            .containers
            .map(|containers| containers.into_keys().collect())
            .unwrap_or_default())
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<String> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels,
            ..Default::default()
        };

        let volume = self
            .client
            .create_volume(options)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create volume: {}", e)))?;

        info!("Volume {} created", volume.name);
        Ok(volume.name)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        ignore_missing(
            self.client
                .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
                .await,
        )?;
        info!("Volume {} removed", name);
        Ok(())
    }

    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String> {
        self.ensure_image(&opts.image).await?;

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = opts
            .volumes
            .iter()
            .map(|(volume, path)| format!("{}:{}", volume, path))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &opts.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    // Empty host port lets the engine pick an ephemeral one
                    host_port: Some(String::new()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: opts.network,
            memory: opts.memory_limit,
            nano_cpus: opts.nano_cpus,
            privileged: Some(opts.privileged),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(opts.image),
            env: if env.is_empty() { None } else { Some(env) },
            cmd: opts.cmd,
            labels: if opts.labels.is_empty() {
                None
            } else {
                Some(opts.labels)
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: opts.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create container: {}", e)))?;

        info!("Container {} created with ID: {}", opts.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to start container: {}", e)))?;

        info!("Container {} started", id);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        ignore_missing(self.client.remove_container(id, Some(options)).await)?;
        info!("Container {} removed", id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspection> {
        let info = self.client.inspect_container(id, None).await?;

        let (running, health) = info
            .state
            .map(|state| {
                let health = state
                    .health
                    .and_then(|h| h.status)
                    .map(|s| format!("{:?}", s).to_lowercase());
                (state.running.unwrap_or(false), health)
            })
            .unwrap_or((false, None));

        let mut ports = HashMap::new();
        let port_map = info.network_settings.and_then(|ns| ns.ports).unwrap_or_default();
        for (container_port, bindings) in port_map {
            let host = bindings.and_then(|b| b.into_iter().next()).and_then(|b| {
                let port = b.host_port?;
                let ip = b.host_ip.unwrap_or_else(|| "0.0.0.0".to_string());
                Some(format!("{}:{}", ip, port))
            });
            if let Some(host) = host {
                ports.insert(container_port, host);
            }
        }

        Ok(ContainerInspection {
            running,
            health,
            ports,
        })
    }

    async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        env: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let start = Instant::now();
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv),
                    env: if env.is_empty() { None } else { Some(env) },
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut buffer = OutputBuffer::default();

        let collect = async {
            if let StartExecResults::Attached { mut output, .. } =
                self.client.start_exec(&exec.id, None).await?
            {
                while let Some(chunk) = output.next().await {
                    buffer.push(chunk?);
                }
            }
            Ok::<(), Error>(())
        };

        tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| Error::CommandTimeout(timeout.as_millis() as u64))??;

        let (stdout, stderr) = buffer.into_strings();

        let inspect = self.client.inspect_exec(&exec.id).await?;

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<String> {
        let mut stream = self.client.logs(id, Some(Self::logs_options(options, false)));
        let mut output = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    output.extend_from_slice(&message)
                }
                _ => {}
            }
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn follow_logs(&self, id: &str, options: &LogOptions) -> Result<LogStream> {
        let stream = self.client.logs(id, Some(Self::logs_options(options, true)));
        Ok(stream
            .map(|chunk| chunk.map(log_text).map_err(Error::from))
            .boxed())
    }

    async fn build_image(&self, tag: &str, dockerfile: &str) -> Result<()> {
        info!("Building image: {}", tag);

        // Single-entry build context
        let mut archive = tar::Builder::new(Vec::new());
        let bytes = dockerfile.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_path("Dockerfile")?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append(&header, bytes)?;
        let context = archive.into_inner()?;

        let options = BuildImageOptions {
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(bytes::Bytes::from(context)));
        while let Some(result) = stream.next().await {
            let info = result
                .map_err(|e| Error::DockerError(format!("Image build failed: {}", e)))?;
            if let Some(line) = info.stream {
                debug!("Build: {}", line.trim());
            }
            if let Some(error) = info.error {
                return Err(Error::DockerError(format!("Image build failed: {}", error)));
            }
        }

        info!("Image {} built", tag);
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        ignore_missing(
            self.client
                .remove_image(tag, Some(options), None)
                .await
                .map(|_| ()),
        )?;
        info!("Image {} removed", tag);
        Ok(())
    }
}
