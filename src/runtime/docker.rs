//! Container runtime CLI wrapper
//!
//! Argument generation is kept in pure functions so every command the
//! lifecycle manager issues can be checked without a container runtime.
//! [`DockerCli`] and [`Endpoint`] are the thin async layer that runs them
//! through a [`CommandExecutor`].

use std::sync::Arc;
use std::time::Duration;

use super::executor::{CommandExecutor, CommandOutput, ExecError};

/// Everything needed to start one device container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRunSpec {
    pub container_name: String,
    pub hostname: String,
    pub network: String,
    pub ip_address: String,
    pub router_ip: String,
    pub image: String,
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Generate Docker run arguments for a device container
///
/// The device gets a static address on its own network, learns the shaping
/// endpoint through `ROUTER_IP` and may manage its own routes.
pub fn generate_run_args(spec: &DeviceRunSpec) -> Vec<String> {
    let mut args = strings(&["run", "-d"]);

    args.push("--name".to_string());
    args.push(spec.container_name.clone());

    args.push("--hostname".to_string());
    args.push(spec.hostname.clone());

    args.push("--network".to_string());
    args.push(spec.network.clone());

    args.push("--ip".to_string());
    args.push(spec.ip_address.clone());

    args.push("-e".to_string());
    args.push(format!("ROUTER_IP={}", spec.router_ip));

    args.push("--restart".to_string());
    args.push("unless-stopped".to_string());

    args.push("--cap-add".to_string());
    args.push("NET_ADMIN".to_string());

    args.push(spec.image.clone());
    args
}

pub fn generate_start_args(container_name: &str) -> Vec<String> {
    strings(&["start", container_name])
}

/// Generate Docker rm arguments
pub fn generate_rm_args(container_name: &str) -> Vec<String> {
    strings(&["rm", "-f", container_name])
}

/// Prints `true`/`false` for the container's running flag
pub fn generate_inspect_running_args(container_name: &str) -> Vec<String> {
    strings(&["inspect", "-f", "{{.State.Running}}", container_name])
}

/// List managed containers, one name per line. `all` includes stopped ones.
pub fn generate_ps_args(prefix: &str, all: bool) -> Vec<String> {
    let mut args = vec!["ps".to_string()];
    if all {
        args.push("-a".to_string());
    }
    args.push("--filter".to_string());
    args.push(format!("name=^{}_", prefix));
    args.push("--format".to_string());
    args.push("{{.Names}}".to_string());
    args
}

/// Every container with its running flag: `name running|exited|...`
pub fn generate_ps_status_args() -> Vec<String> {
    strings(&["ps", "-a", "--format", "{{.Names}} {{.State}}"])
}

pub fn generate_network_inspect_args(network: &str) -> Vec<String> {
    strings(&["network", "inspect", network])
}

pub fn generate_network_create_args(network: &str, subnet: &str) -> Vec<String> {
    strings(&[
        "network", "create", "--driver", "bridge", "--subnet", subnet, network,
    ])
}

pub fn generate_network_connect_args(network: &str, container: &str, ip: &str) -> Vec<String> {
    strings(&["network", "connect", "--ip", ip, network, container])
}

pub fn generate_network_disconnect_args(network: &str, container: &str) -> Vec<String> {
    strings(&["network", "disconnect", "-f", network, container])
}

pub fn generate_network_rm_args(network: &str) -> Vec<String> {
    strings(&["network", "rm", network])
}

pub fn generate_exec_args(container: &str, command: &[String], detached: bool) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if detached {
        args.push("-d".to_string());
    }
    args.push(container.to_string());
    args.extend(command.iter().cloned());
    args
}

/// Runtime message for a missing container, network or endpoint
pub fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no such") || lower.contains("not found") || lower.contains("is not connected")
}

/// Runtime message for a resource that is already in place
pub fn is_already_exists(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already exists") || lower.contains("file exists")
}

/// Parse `docker ps --format {{.Names}}` output
pub fn parse_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Async handle on the container runtime binary
#[derive(Clone)]
pub struct DockerCli {
    executor: Arc<dyn CommandExecutor>,
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            bin: bin.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run and return the output whatever the exit status
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput, ExecError> {
        self.executor.run(&self.bin, args, self.timeout).await
    }

    /// Run and treat a non-zero exit as an error
    pub async fn run_checked(&self, args: &[String]) -> Result<CommandOutput, ExecError> {
        self.run(args).await?.into_result(&self.bin, args)
    }

    /// Run a command inside a container
    pub async fn exec_in(
        &self,
        container: &str,
        command: &[String],
    ) -> Result<CommandOutput, ExecError> {
        self.run(&generate_exec_args(container, command, false)).await
    }

    /// Start a command inside a container without waiting for it
    pub async fn exec_detached(
        &self,
        container: &str,
        command: &[String],
    ) -> Result<CommandOutput, ExecError> {
        self.run_checked(&generate_exec_args(container, command, true))
            .await
    }

    /// Handle on a command-capable container
    pub fn endpoint(&self, container: impl Into<String>) -> Endpoint {
        Endpoint {
            docker: self.clone(),
            container: container.into(),
        }
    }
}

/// A container commands can be run in, typically the shaping endpoint
#[derive(Clone)]
pub struct Endpoint {
    docker: DockerCli,
    container: String,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.container
    }

    /// Run a command inside the endpoint, output returned whatever the status
    pub async fn run(&self, command: &[String]) -> Result<CommandOutput, ExecError> {
        self.docker.exec_in(&self.container, command).await
    }

    /// Run with an explicit deadline, used by the sampler
    pub async fn run_with_timeout(
        &self,
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let args = generate_exec_args(&self.container, command, false);
        self.docker.executor.run(&self.docker.bin, &args, timeout).await
    }
}
