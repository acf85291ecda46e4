//! Container Driver (C6): the container-daemon capability the rest of the
//! pipeline is built against, plus a CLI-backed implementation that shells
//! out to `docker`/`podman` the way the reference "docker.rs" example
//! drives `docker buildx`/`push`/`compose` — `std::process::Command`,
//! checked exit status, stdout parsed as JSON where the daemon offers it.
//! See SPEC_FULL.md §A.6 and §4.6.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::error::CaptnError;
use crate::types::{
    Container, ContainerState, HealthState, Mount, PortMapping, ResourceLimits, RestartPolicy,
};

/// The capability every update step is expressed against. Exists so the
/// executor and coordinator can be tested against [`fake::FakeDriver`]
/// without a real daemon.
pub trait ContainerDriver {
    fn list(&self) -> Result<Vec<Container>, CaptnError>;
    fn inspect(&self, id: &str) -> Result<Container, CaptnError>;
    fn pull_image(&self, image_ref: &str) -> Result<String, CaptnError>;
    fn create_container(&self, spec: &NewContainerSpec) -> Result<String, CaptnError>;
    fn start(&self, id: &str) -> Result<(), CaptnError>;
    fn stop(&self, id: &str, timeout: Duration) -> Result<(), CaptnError>;
    fn rename(&self, id: &str, new_name: &str) -> Result<(), CaptnError>;
    fn remove(&self, id: &str) -> Result<(), CaptnError>;
    fn remove_image(&self, image_ref: &str) -> Result<(), CaptnError>;
    /// Override a container's restart policy in place, without recreating
    /// it. Used to strip auto-restart from the old container while it's
    /// parked under its backup name during STOP_OLD, and to restore it on
    /// rollback (§4.10).
    fn set_restart_policy(&self, id: &str, policy: &RestartPolicy) -> Result<(), CaptnError>;
}

/// Everything needed to recreate a container against a new image, built by
/// the executor per §4.6: image swapped for the target, digest-pinned
/// reference, environment re-filtered via [`crate::envfilter`], everything
/// else (name, mounts, networks, ports, restart policy, resource limits,
/// labels) carried over verbatim plus an appended `lastUpdatedAt` label.
#[derive(Debug, Clone)]
pub struct NewContainerSpec {
    pub name: String,
    pub image_ref: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub networks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub restart_policy: RestartPolicy,
    pub resource_limits: ResourceLimits,
    /// Command override. `None` keeps the image's own entrypoint/cmd;
    /// `Some` is used for the disposable self-update helper container,
    /// which runs a generated shell script instead of the target image's
    /// normal process (§4.10).
    pub command: Option<Vec<String>>,
}

/// The label appended (or overwritten) on every container captn recreates.
pub const LAST_UPDATED_LABEL: &str = "captn.lastUpdatedAt";

impl NewContainerSpec {
    /// Build the spec for updating `old` to `image_ref`, with `env` already
    /// resolved through the env-filter.
    pub fn from_update(old: &Container, image_ref: &str, env: BTreeMap<String, String>) -> Self {
        let mut labels = old.labels.clone();
        labels.insert(LAST_UPDATED_LABEL.to_string(), Utc::now().to_rfc3339());

        NewContainerSpec {
            name: old.name.clone(),
            image_ref: image_ref.to_string(),
            env,
            labels,
            mounts: old.mounts.clone(),
            networks: old.networks.clone(),
            ports: old.ports.clone(),
            restart_policy: old.restart_policy.clone(),
            resource_limits: old.resource_limits.clone(),
            command: None,
        }
    }
}

/// Shells out to the binary named by `binary` (`"docker"` or `"podman"`).
pub struct CliDriver {
    binary: String,
}

impl CliDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        CliDriver { binary: binary.into() }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, CaptnError> {
        let output = self
            .command(args)
            .output()
            .map_err(|e| CaptnError::DaemonUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(classify_cli_failure(args, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn classify_cli_failure(args: &[&str], stderr: &str) -> CaptnError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") {
        return CaptnError::ContainerNotFound(stderr.trim().to_string());
    }
    if lower.contains("already in use") || lower.contains("name is already") {
        return CaptnError::ConflictName(stderr.trim().to_string());
    }
    if lower.contains("cannot connect") || lower.contains("is the docker daemon running") {
        return CaptnError::DaemonUnavailable(stderr.trim().to_string());
    }
    if args.first() == Some(&"pull") {
        return CaptnError::ImagePullFailed(stderr.trim().to_string());
    }
    if args.first() == Some(&"start") {
        return CaptnError::StartFailed(stderr.trim().to_string());
    }
    CaptnError::DaemonUnavailable(stderr.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "Image")]
    image: String,
}

#[derive(Debug, Deserialize)]
struct InspectHostConfig {
    #[serde(rename = "RestartPolicy")]
    restart_policy: InspectRestartPolicy,
    #[serde(rename = "Memory", default)]
    memory: i64,
    #[serde(rename = "NanoCpus", default)]
    nano_cpus: i64,
}

#[derive(Debug, Deserialize)]
struct InspectRestartPolicy {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "MaximumRetryCount", default)]
    maximum_retry_count: u32,
}

#[derive(Debug, Deserialize)]
struct InspectMount {
    #[serde(rename = "Source")]
    source: String,
    #[serde(rename = "Destination")]
    destination: String,
    #[serde(rename = "RW")]
    rw: bool,
}

#[derive(Debug, Deserialize)]
struct InspectJson {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Created")]
    created: chrono::DateTime<Utc>,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "HostConfig")]
    host_config: InspectHostConfig,
    #[serde(rename = "Mounts", default)]
    mounts: Vec<InspectMount>,
    #[serde(rename = "NetworkSettings")]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Ports", default)]
    ports: BTreeMap<String, Option<Vec<InspectPortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct InspectPortBinding {
    #[serde(rename = "HostIp")]
    host_ip: String,
    #[serde(rename = "HostPort")]
    host_port: String,
}

fn parse_state(status: &str) -> ContainerState {
    match status {
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "restarting" => ContainerState::Restarting,
        "exited" => ContainerState::Exited,
        "dead" => ContainerState::Dead,
        "removing" => ContainerState::Removing,
        _ => ContainerState::Dead,
    }
}

fn parse_health(health: Option<&InspectHealth>) -> HealthState {
    match health.map(|h| h.status.as_str()) {
        None => HealthState::None,
        Some("starting") => HealthState::Starting,
        Some("healthy") => HealthState::Healthy,
        Some("unhealthy") => HealthState::Unhealthy,
        Some(_) => HealthState::None,
    }
}

fn parse_restart_policy(p: &InspectRestartPolicy) -> RestartPolicy {
    match p.name.as_str() {
        "always" => RestartPolicy::Always,
        "unless-stopped" => RestartPolicy::UnlessStopped,
        "on-failure" => RestartPolicy::OnFailure {
            max_retries: if p.maximum_retry_count > 0 {
                Some(p.maximum_retry_count)
            } else {
                None
            },
        },
        _ => RestartPolicy::No,
    }
}

fn parse_env(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_ports(ports: &BTreeMap<String, Option<Vec<InspectPortBinding>>>) -> Vec<PortMapping> {
    ports
        .iter()
        .flat_map(|(key, bindings)| {
            let mut parts = key.splitn(2, '/');
            let container_port: u16 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let protocol = parts.next().unwrap_or("tcp").to_string();
            match bindings {
                Some(bindings) => bindings
                    .iter()
                    .map(|b| PortMapping {
                        host_ip: if b.host_ip.is_empty() { None } else { Some(b.host_ip.clone()) },
                        host_port: b.host_port.parse().ok(),
                        container_port,
                        protocol: protocol.clone(),
                    })
                    .collect::<Vec<_>>(),
                None => vec![PortMapping {
                    host_ip: None,
                    host_port: None,
                    container_port,
                    protocol: protocol.clone(),
                }],
            }
        })
        .collect()
}

fn to_container(raw: InspectJson) -> Container {
    let (image, tag) = match raw.config.image.rsplit_once(':') {
        Some((image, tag)) => (image.to_string(), tag.to_string()),
        None => (raw.config.image.clone(), "latest".to_string()),
    };

    Container {
        id: raw.id,
        name: raw.name.trim_start_matches('/').to_string(),
        image,
        tag,
        digest: None,
        labels: raw.config.labels,
        env: parse_env(&raw.config.env),
        mounts: raw
            .mounts
            .into_iter()
            .map(|m| Mount {
                source: m.source,
                destination: m.destination,
                read_only: !m.rw,
            })
            .collect(),
        networks: raw.network_settings.networks.keys().cloned().collect(),
        ports: parse_ports(&raw.network_settings.ports),
        restart_policy: parse_restart_policy(&raw.host_config.restart_policy),
        resource_limits: ResourceLimits {
            memory_bytes: if raw.host_config.memory > 0 {
                Some(raw.host_config.memory as u64)
            } else {
                None
            },
            nano_cpus: if raw.host_config.nano_cpus > 0 {
                Some(raw.host_config.nano_cpus)
            } else {
                None
            },
        },
        created_at: raw.created,
        state: parse_state(&raw.state.status),
        health_state: parse_health(raw.state.health.as_ref()),
    }
}

impl ContainerDriver for CliDriver {
    fn list(&self) -> Result<Vec<Container>, CaptnError> {
        let stdout = self.run_checked(&["ps", "-a", "-q"])?;
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|id| self.inspect(id.trim()))
            .collect()
    }

    fn inspect(&self, id: &str) -> Result<Container, CaptnError> {
        let stdout = self.run_checked(&["inspect", id])?;
        let mut parsed: Vec<InspectJson> = serde_json::from_str(&stdout)
            .map_err(|e| CaptnError::ProtocolError(format!("inspect {id}: {e}")))?;
        let raw = parsed
            .pop()
            .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))?;
        Ok(to_container(raw))
    }

    fn pull_image(&self, image_ref: &str) -> Result<String, CaptnError> {
        self.run_checked(&["pull", image_ref])?;
        let digest_out = self.run_checked(&[
            "inspect",
            "--format",
            "{{index .RepoDigests 0}}",
            image_ref,
        ])?;
        let digest = digest_out
            .trim()
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_else(|| digest_out.trim().to_string());
        Ok(digest)
    }

    fn create_container(&self, spec: &NewContainerSpec) -> Result<String, CaptnError> {
        let mut args: Vec<String> = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &spec.labels {
            args.push("-l".to_string());
            args.push(format!("{k}={v}"));
        }
        for m in &spec.mounts {
            let ro = if m.read_only { ":ro" } else { "" };
            args.push("-v".to_string());
            args.push(format!("{}:{}{}", m.source, m.destination, ro));
        }
        for n in &spec.networks {
            args.push("--network".to_string());
            args.push(n.clone());
        }
        for p in &spec.ports {
            args.push("-p".to_string());
            let host = match (p.host_ip.as_ref(), p.host_port) {
                (Some(ip), Some(port)) => format!("{ip}:{port}:"),
                (None, Some(port)) => format!("{port}:"),
                _ => String::new(),
            };
            args.push(format!("{host}{}/{}", p.container_port, p.protocol));
        }
        match &spec.restart_policy {
            RestartPolicy::No => {
                args.push("--restart".to_string());
                args.push("no".to_string());
            }
            RestartPolicy::Always => {
                args.push("--restart".to_string());
                args.push("always".to_string());
            }
            RestartPolicy::UnlessStopped => {
                args.push("--restart".to_string());
                args.push("unless-stopped".to_string());
            }
            RestartPolicy::OnFailure { max_retries } => {
                args.push("--restart".to_string());
                match max_retries {
                    Some(n) => args.push(format!("on-failure:{n}")),
                    None => args.push("on-failure".to_string()),
                }
            }
        }
        if let Some(mem) = spec.resource_limits.memory_bytes {
            args.push("--memory".to_string());
            args.push(mem.to_string());
        }
        if let Some(cpus) = spec.resource_limits.nano_cpus {
            args.push("--cpus".to_string());
            args.push(format!("{:.2}", cpus as f64 / 1_000_000_000.0));
        }
        args.push(spec.image_ref.clone());
        if let Some(command) = &spec.command {
            args.extend(command.iter().cloned());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run_checked(&arg_refs)?;
        Ok(stdout.trim().to_string())
    }

    fn start(&self, id: &str) -> Result<(), CaptnError> {
        self.run_checked(&["start", id]).map(|_| ())
    }

    fn stop(&self, id: &str, timeout: Duration) -> Result<(), CaptnError> {
        let secs = timeout.as_secs().to_string();
        self.run_checked(&["stop", "-t", &secs, id]).map(|_| ())
    }

    fn rename(&self, id: &str, new_name: &str) -> Result<(), CaptnError> {
        self.run_checked(&["rename", id, new_name]).map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<(), CaptnError> {
        self.run_checked(&["rm", "-f", id]).map(|_| ())
    }

    fn remove_image(&self, image_ref: &str) -> Result<(), CaptnError> {
        self.run_checked(&["rmi", image_ref]).map(|_| ())
    }

    fn set_restart_policy(&self, id: &str, policy: &RestartPolicy) -> Result<(), CaptnError> {
        let value = match policy {
            RestartPolicy::No => "no".to_string(),
            RestartPolicy::Always => "always".to_string(),
            RestartPolicy::UnlessStopped => "unless-stopped".to_string(),
            RestartPolicy::OnFailure { max_retries: Some(n) } => format!("on-failure:{n}"),
            RestartPolicy::OnFailure { max_retries: None } => "on-failure".to_string(),
        };
        self.run_checked(&["update", "--restart", &value, id]).map(|_| ())
    }
}

/// An in-memory `ContainerDriver` for executor/coordinator tests, grounded
/// on the same fake-backend approach the registry client's tests use a
/// local HTTP server for: a deterministic stand-in instead of a mock.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub container: Container,
        pub fail_start: bool,
    }

    #[derive(Default)]
    pub struct FakeDriver {
        pub containers: Mutex<BTreeMap<String, FakeContainer>>,
        pub images: Mutex<BTreeMap<String, String>>,
        pub fail_pull: Mutex<BTreeMap<String, String>>,
        /// Container names that should come up unhealthy when (re)created,
        /// so tests can exercise the verify-then-rollback path.
        pub unhealthy_on_create: Mutex<std::collections::BTreeSet<String>>,
        pub next_id: Mutex<u64>,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            FakeDriver::default()
        }

        pub fn insert(&self, container: Container) {
            self.containers.lock().unwrap().insert(
                container.id.clone(),
                FakeContainer {
                    container,
                    fail_start: false,
                },
            );
        }

        pub fn set_image_digest(&self, image_ref: &str, digest: &str) {
            self.images
                .lock()
                .unwrap()
                .insert(image_ref.to_string(), digest.to_string());
        }

        pub fn set_fail_pull(&self, image_ref: &str, reason: &str) {
            self.fail_pull
                .lock()
                .unwrap()
                .insert(image_ref.to_string(), reason.to_string());
        }

        pub fn set_fail_start(&self, id: &str) {
            if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
                c.fail_start = true;
            }
        }

        pub fn set_unhealthy_on_create(&self, name: &str) {
            self.unhealthy_on_create
                .lock()
                .unwrap()
                .insert(name.to_string());
        }

        fn fresh_id(&self) -> String {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("fake-{}", *next)
        }
    }

    impl ContainerDriver for FakeDriver {
        fn list(&self) -> Result<Vec<Container>, CaptnError> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .values()
                .map(|c| c.container.clone())
                .collect())
        }

        fn inspect(&self, id: &str) -> Result<Container, CaptnError> {
            self.containers
                .lock()
                .unwrap()
                .get(id)
                .map(|c| c.container.clone())
                .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))
        }

        fn pull_image(&self, image_ref: &str) -> Result<String, CaptnError> {
            if let Some(reason) = self.fail_pull.lock().unwrap().get(image_ref) {
                return Err(CaptnError::ImagePullFailed(reason.clone()));
            }
            Ok(self
                .images
                .lock()
                .unwrap()
                .get(image_ref)
                .cloned()
                .unwrap_or_else(|| "sha256:fakedigest".to_string()))
        }

        fn create_container(&self, spec: &NewContainerSpec) -> Result<String, CaptnError> {
            let already_in_use = self
                .containers
                .lock()
                .unwrap()
                .values()
                .any(|c| c.container.name == spec.name);
            if already_in_use {
                return Err(CaptnError::ConflictName(spec.name.clone()));
            }

            let id = self.fresh_id();
            let (image, tag) = match spec.image_ref.rsplit_once(':') {
                Some((i, t)) => (i.to_string(), t.to_string()),
                None => (spec.image_ref.clone(), "latest".to_string()),
            };
            let health_state = if self.unhealthy_on_create.lock().unwrap().contains(&spec.name) {
                HealthState::Unhealthy
            } else {
                HealthState::None
            };
            let container = Container {
                id: id.clone(),
                name: spec.name.clone(),
                image,
                tag,
                digest: None,
                labels: spec.labels.clone(),
                env: spec.env.clone(),
                mounts: spec.mounts.clone(),
                networks: spec.networks.clone(),
                ports: spec.ports.clone(),
                restart_policy: spec.restart_policy.clone(),
                resource_limits: spec.resource_limits.clone(),
                created_at: Utc::now(),
                state: ContainerState::Created,
                health_state,
            };
            self.containers.lock().unwrap().insert(
                id.clone(),
                FakeContainer {
                    container,
                    fail_start: false,
                },
            );
            Ok(id)
        }

        fn start(&self, id: &str) -> Result<(), CaptnError> {
            let mut containers = self.containers.lock().unwrap();
            let entry = containers
                .get_mut(id)
                .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))?;
            if entry.fail_start {
                return Err(CaptnError::StartFailed("simulated start failure".to_string()));
            }
            entry.container.state = ContainerState::Running;
            Ok(())
        }

        fn stop(&self, id: &str, _timeout: Duration) -> Result<(), CaptnError> {
            let mut containers = self.containers.lock().unwrap();
            let entry = containers
                .get_mut(id)
                .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))?;
            entry.container.state = ContainerState::Exited;
            Ok(())
        }

        fn rename(&self, id: &str, new_name: &str) -> Result<(), CaptnError> {
            let mut containers = self.containers.lock().unwrap();
            let entry = containers
                .get_mut(id)
                .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))?;
            entry.container.name = new_name.to_string();
            Ok(())
        }

        fn remove(&self, id: &str) -> Result<(), CaptnError> {
            self.containers
                .lock()
                .unwrap()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))
        }

        fn remove_image(&self, image_ref: &str) -> Result<(), CaptnError> {
            self.images.lock().unwrap().remove(image_ref);
            Ok(())
        }

        fn set_restart_policy(&self, id: &str, policy: &RestartPolicy) -> Result<(), CaptnError> {
            let mut containers = self.containers.lock().unwrap();
            let entry = containers
                .get_mut(id)
                .ok_or_else(|| CaptnError::ContainerNotFound(id.to_string()))?;
            entry.container.restart_policy = policy.clone();
            Ok(())
        }
    }
}
