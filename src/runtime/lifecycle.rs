//! Device infrastructure lifecycle
//!
//! Create path, strictly sequential:
//! network -> router attachment -> router interface -> shaping hierarchy ->
//! iperf3 server -> device container. Every step tolerates its resource
//! already existing, so re-running create on a half-provisioned device
//! finishes the job.
//!
//! The container comes last, after the router wiring rather than before it.
//! The interface and the hierarchy only depend on the network and the
//! router, and a device container never runs unshaped: a failure at any
//! earlier step leaves no container behind.
//!
//! Destroy path: every step is attempted whatever happened before it and
//! missing resources count as removed. Everything else that fails is
//! collected into [`LifecycleError::Teardown`].

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::docker::{
    self, generate_inspect_running_args, generate_network_connect_args,
    generate_network_create_args, generate_network_disconnect_args,
    generate_network_inspect_args, generate_network_rm_args, generate_ps_args,
    generate_ps_status_args, generate_rm_args, generate_run_args, generate_start_args,
    is_already_exists, is_not_found, DeviceRunSpec, DockerCli, Endpoint,
};
use super::executor::ExecError;
use super::traffic::{self, iperf_port};
use crate::config::Settings;
use crate::shaping::hierarchy;
use crate::shaping::parsers::parse_interface_for_ip;
use crate::store::Device;
use crate::topology::{ifb_device_name, network_for_container};

/// Errors that can occur while provisioning or removing device resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Provisioning {container} failed at {step}: {message}")]
    Provisioning {
        container: String,
        step: &'static str,
        message: String,
        /// Router interface discovered before the failure
        interface: Option<String>,
    },

    #[error("Teardown of {target} incomplete: {}", errors.join("; "))]
    Teardown { target: String, errors: Vec<String> },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl LifecycleError {
    /// Interface known at the time of a provisioning failure
    pub fn interface(&self) -> Option<&str> {
        match self {
            LifecycleError::Provisioning { interface, .. } => interface.as_deref(),
            _ => None,
        }
    }
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub interface: String,
    /// `None` when ingress redirection is unavailable on the endpoint
    pub ifb_device: Option<String>,
}

/// Outcome of a bulk kill
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    docker: DockerCli,
    router: Endpoint,
    image: String,
    prefix: String,
    iperf_base_port: u16,
    detect_attempts: u32,
    detect_delay: Duration,
}

impl LifecycleManager {
    pub fn new(docker: DockerCli, settings: &Settings) -> Self {
        let router = docker.endpoint(settings.router_container.clone());
        Self {
            docker,
            router,
            image: settings.client_image.clone(),
            prefix: settings.naming.prefix.clone(),
            iperf_base_port: settings.iperf_base_port,
            detect_attempts: 3,
            detect_delay: Duration::from_millis(500),
        }
    }

    /// Override interface detection retries
    pub fn with_detect_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.detect_attempts = attempts.max(1);
        self.detect_delay = delay;
        self
    }

    pub fn docker(&self) -> &DockerCli {
        &self.docker
    }

    /// The shaping endpoint
    pub fn router(&self) -> &Endpoint {
        &self.router
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Bring every resource of `device` into existence.
    ///
    /// Idempotent. A failure leaves no device container behind since the
    /// container is the last step.
    pub async fn create_device(&self, device: &Device) -> Result<Provisioned, LifecycleError> {
        let container = device.container_name.as_str();
        let fail = |step: &'static str, message: String, interface: Option<String>| {
            LifecycleError::Provisioning {
                container: container.to_string(),
                step,
                message,
                interface,
            }
        };

        info!("Provisioning {} on {}", container, device.subnet);

        self.ensure_network(device)
            .await
            .map_err(|m| fail("network", m, None))?;

        self.connect_router(device)
            .await
            .map_err(|m| fail("router", m, None))?;

        let interface = self
            .detect_interface(&device.router_ip)
            .await
            .map_err(|m| fail("interface", m, None))?;

        let ifb = ifb_device_name(device.slot);
        let init = hierarchy::initialize(&self.router, &interface, &ifb)
            .await
            .map_err(|e| fail("shaping", e.to_string(), Some(interface.clone())))?;

        // Bandwidth tests are optional; the device runs without a server
        let port = iperf_port(self.iperf_base_port, device.slot);
        if let Err(e) = traffic::ensure_server(&self.router, port).await {
            warn!("No iperf3 server for {}: {}", container, e);
        }

        self.ensure_container(device)
            .await
            .map_err(|m| fail("container", m, Some(interface.clone())))?;

        info!("{} running behind {}", container, interface);
        Ok(Provisioned {
            interface,
            ifb_device: init.upstream.then_some(ifb),
        })
    }

    async fn ensure_network(&self, device: &Device) -> Result<(), String> {
        let network = &device.network_name;
        let inspect = self
            .docker
            .run(&generate_network_inspect_args(network))
            .await
            .map_err(|e| e.to_string())?;
        if inspect.success() {
            debug!("Reusing network {}", network);
            return Ok(());
        }

        let out = self
            .docker
            .run(&generate_network_create_args(network, &device.subnet))
            .await
            .map_err(|e| e.to_string())?;
        if out.success() || is_already_exists(&out.combined()) {
            Ok(())
        } else {
            Err(out.combined())
        }
    }

    async fn connect_router(&self, device: &Device) -> Result<(), String> {
        let out = self
            .docker
            .run(&generate_network_connect_args(
                &device.network_name,
                self.router.name(),
                &device.router_ip,
            ))
            .await
            .map_err(|e| e.to_string())?;
        if out.success() || is_already_exists(&out.combined()) {
            Ok(())
        } else {
            Err(out.combined())
        }
    }

    /// Find the router interface holding `router_ip`, retrying while the
    /// runtime finishes wiring it
    pub async fn detect_interface(&self, router_ip: &str) -> Result<String, String> {
        let command: Vec<String> = ["ip", "-4", "-o", "addr", "show"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut last_error = format!("no interface holds {}", router_ip);
        for attempt in 1..=self.detect_attempts {
            match self.router.run(&command).await {
                Ok(out) if out.success() => {
                    if let Some(iface) = parse_interface_for_ip(&out.stdout, router_ip) {
                        debug!("{} is on {} (attempt {})", router_ip, iface, attempt);
                        return Ok(iface);
                    }
                }
                Ok(out) => last_error = out.combined(),
                Err(e) => last_error = e.to_string(),
            }
            if attempt < self.detect_attempts {
                tokio::time::sleep(self.detect_delay).await;
            }
        }
        Err(last_error)
    }

    async fn ensure_container(&self, device: &Device) -> Result<(), String> {
        let name = &device.container_name;
        let inspect = self
            .docker
            .run(&generate_inspect_running_args(name))
            .await
            .map_err(|e| e.to_string())?;

        if inspect.success() {
            if inspect.stdout.trim() == "true" {
                debug!("{} already running", name);
                return Ok(());
            }
            return self
                .docker
                .run_checked(&generate_start_args(name))
                .await
                .map(|_| ())
                .map_err(|e| e.to_string());
        }

        let spec = DeviceRunSpec {
            container_name: name.clone(),
            hostname: crate::topology::sanitize(&device.name),
            network: device.network_name.clone(),
            ip_address: device.ip_address.clone(),
            router_ip: device.router_ip.clone(),
            image: self.image.clone(),
        };
        self.docker
            .run_checked(&generate_run_args(&spec))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Remove every resource of `device`, including partially provisioned ones
    pub async fn destroy_device(&self, device: &Device) -> Result<(), LifecycleError> {
        info!("Destroying {}", device.container_name);
        let mut errors = Vec::new();

        if let Err(e) = self.remove_container(&device.container_name).await {
            errors.push(e);
        }

        // Interface may be unknown for a device that failed mid-create
        let interface = match &device.interface_name {
            Some(iface) => Some(iface.clone()),
            None => self
                .clone()
                .with_detect_retry(1, Duration::ZERO)
                .detect_interface(&device.router_ip)
                .await
                .ok(),
        };
        let ifb = ifb_device_name(device.slot);
        let shaping_errors = match &interface {
            Some(iface) => hierarchy::teardown(&self.router, iface, Some(&ifb)).await,
            None => hierarchy::remove_ifb(&self.router, &ifb).await.err().into_iter().collect(),
        };
        errors.extend(shaping_errors.into_iter().map(|e| e.to_string()));

        let port = iperf_port(self.iperf_base_port, device.slot);
        if let Err(e) = traffic::stop_server(&self.router, port).await {
            errors.push(format!("stop iperf3 server on {}: {}", port, e));
        }

        if let Err(e) = self.remove_network(&device.network_name).await {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            warn!("Teardown of {} incomplete: {:?}", device.container_name, errors);
            Err(LifecycleError::Teardown {
                target: device.container_name.clone(),
                errors,
            })
        }
    }

    /// Remove a managed container that has no device row, and its network
    pub async fn destroy_orphan(&self, container: &str) -> Result<(), LifecycleError> {
        info!("Removing orphan {}", container);
        let mut errors = Vec::new();

        if let Err(e) = self.remove_container(container).await {
            errors.push(e);
        }
        if let Some(network) = network_for_container(&self.prefix, container) {
            if let Err(e) = self.remove_network(&network).await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Teardown {
                target: container.to_string(),
                errors,
            })
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), String> {
        match self.docker.run(&generate_rm_args(name)).await {
            Ok(out) if out.success() || is_not_found(&out.combined()) => Ok(()),
            Ok(out) => Err(format!("remove {}: {}", name, out.combined())),
            Err(e) => Err(format!("remove {}: {}", name, e)),
        }
    }

    /// Detach the router, then drop the network
    async fn remove_network(&self, network: &str) -> Result<(), String> {
        let mut errors = Vec::new();

        match self
            .docker
            .run(&generate_network_disconnect_args(network, self.router.name()))
            .await
        {
            Ok(out) if out.success() || is_not_found(&out.combined()) => {}
            Ok(out) => errors.push(format!("disconnect router from {}: {}", network, out.combined())),
            Err(e) => errors.push(format!("disconnect router from {}: {}", network, e)),
        }

        match self.docker.run(&generate_network_rm_args(network)).await {
            Ok(out) if out.success() || is_not_found(&out.combined()) => {}
            Ok(out) => errors.push(format!("remove network {}: {}", network, out.combined())),
            Err(e) => errors.push(format!("remove network {}: {}", network, e)),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Force-remove every managed container, running or not. Networks and
    /// router attachments stay for the next sync.
    pub async fn kill_all(&self) -> Result<KillReport, LifecycleError> {
        let out = self
            .docker
            .run_checked(&generate_ps_args(&self.prefix, true))
            .await?;
        let names = docker::parse_names(&out.stdout);

        let results = join_all(names.iter().map(|name| async move {
            (name.clone(), self.remove_container(name).await)
        }))
        .await;

        let mut report = KillReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.removed.push(name),
                Err(e) => report.errors.push(e),
            }
        }
        info!(
            "Killed {} containers ({} errors)",
            report.removed.len(),
            report.errors.len()
        );
        Ok(report)
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Names of running managed containers
    pub async fn list_provisioned(&self) -> Result<Vec<String>, LifecycleError> {
        let out = self
            .docker
            .run_checked(&generate_ps_args(&self.prefix, false))
            .await?;
        let mut names = docker::parse_names(&out.stdout);
        names.sort();
        Ok(names)
    }

    /// Running flag of each named container; unknown names are not running
    pub async fn container_status(&self, names: &[String]) -> Result<BTreeMap<String, bool>, LifecycleError> {
        let out = self.docker.run_checked(&generate_ps_status_args()).await?;
        let states: BTreeMap<&str, &str> = out
            .stdout
            .lines()
            .filter_map(|line| line.trim().split_once(' '))
            .collect();

        Ok(names
            .iter()
            .map(|name| {
                let running = states.get(name.as_str()).is_some_and(|s| s.trim() == "running");
                (name.clone(), running)
            })
            .collect())
    }
}
