//! Bandwidth test sessions
//!
//! A session is an `iperf3` client inside the device container pulling data
//! from the shaping endpoint (`-R`), so the measured flow crosses the
//! device's downstream class. The endpoint runs one daemonized `iperf3`
//! server per slot on `base_port + slot`; it is started with the device and
//! killed when the device is destroyed.

use std::collections::BTreeMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::docker::{DockerCli, Endpoint};
use super::executor::ExecError;
use crate::store::Device;

/// Default session length in seconds
pub const DEFAULT_DURATION_SECS: u64 = 300;
const MAX_DURATION_SECS: u64 = 86_400;

#[derive(Error, Debug)]
pub enum TrafficError {
    #[error("Invalid traffic request: {0}")]
    Validation(String),

    #[error("Traffic command failed in {container}: {message}")]
    Command { container: String, message: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Body of `POST /api/traffic/start` and `/stop`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficRequest {
    pub client: String,
    /// Seconds, defaults to five minutes
    #[serde(default)]
    pub duration: Option<u64>,
    /// Target bitrate in iperf3 syntax, e.g. `10M`
    #[serde(default)]
    pub bandwidth: Option<String>,
}

/// A started session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficSession {
    pub client: String,
    pub container: String,
    pub server: String,
    pub port: u16,
    pub duration: u64,
    pub bandwidth: Option<String>,
}

pub fn generate_iperf_args(server: &str, port: u16, duration: u64, bandwidth: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "iperf3".to_string(),
        "-c".to_string(),
        server.to_string(),
        "-p".to_string(),
        port.to_string(),
        "-t".to_string(),
        duration.to_string(),
        "-R".to_string(),
    ];
    if let Some(bw) = bandwidth {
        args.push("-b".to_string());
        args.push(bw.to_string());
    }
    args
}

fn words(cmd: &[&str]) -> Vec<String> {
    cmd.iter().map(|s| s.to_string()).collect()
}

/// Server port of the device in `slot`
pub fn iperf_port(base_port: u16, slot: u16) -> u16 {
    base_port.saturating_add(slot)
}

pub fn generate_iperf_server_args(port: u16) -> Vec<String> {
    words(&["iperf3", "-s", "-D", "-p", &port.to_string()])
}

/// `pgrep -f`/`pkill -f` pattern matching exactly the server on `port`
fn server_pattern(port: u16) -> String {
    format!("^iperf3 -s -D -p {}$", port)
}

/// Make sure the server for `port` runs on the endpoint. Returns whether it
/// had to be started.
pub async fn ensure_server(router: &Endpoint, port: u16) -> Result<bool, TrafficError> {
    let failure = |message: String| TrafficError::Command {
        container: router.name().to_string(),
        message,
    };

    let probe = router.run(&words(&["pgrep", "-f", &server_pattern(port)])).await?;
    match probe.status {
        0 => return Ok(false),
        1 => {}
        _ => return Err(failure(probe.combined())),
    }

    let out = router.run(&generate_iperf_server_args(port)).await?;
    if !out.success() {
        return Err(failure(format!("iperf3 server on port {}: {}", port, out.combined())));
    }
    debug!("iperf3 server listening on {}:{}", router.name(), port);
    Ok(true)
}

/// Kill the server for `port`; none running is fine
pub async fn stop_server(router: &Endpoint, port: u16) -> Result<(), TrafficError> {
    let out = router.run(&words(&["pkill", "-f", &server_pattern(port)])).await?;
    match out.status {
        0 | 1 => Ok(()),
        _ => Err(TrafficError::Command {
            container: router.name().to_string(),
            message: out.combined(),
        }),
    }
}

#[derive(Clone)]
pub struct TrafficManager {
    docker: DockerCli,
    router: Endpoint,
    base_port: u16,
}

impl TrafficManager {
    pub fn new(docker: DockerCli, router: Endpoint, base_port: u16) -> Self {
        Self {
            docker,
            router,
            base_port,
        }
    }

    /// Server port for a device; one iperf3 server per slot on the endpoint
    pub fn port_for(&self, device: &Device) -> u16 {
        iperf_port(self.base_port, device.slot)
    }

    /// Start a session, replacing any session already running in the container
    pub async fn start(
        &self,
        device: &Device,
        duration: Option<u64>,
        bandwidth: Option<String>,
    ) -> Result<TrafficSession, TrafficError> {
        let duration = duration.unwrap_or(DEFAULT_DURATION_SECS);
        if duration == 0 || duration > MAX_DURATION_SECS {
            return Err(TrafficError::Validation(format!(
                "duration must be between 1 and {} seconds",
                MAX_DURATION_SECS
            )));
        }
        let bandwidth = bandwidth.map(|b| b.trim().to_string()).filter(|b| !b.is_empty());
        if bandwidth.as_deref().is_some_and(|b| b.contains(char::is_whitespace)) {
            return Err(TrafficError::Validation("bandwidth must be a single token".to_string()));
        }

        let container = &device.container_name;
        let port = self.port_for(device);
        // The server dies with the endpoint; bring it back before connecting
        if ensure_server(&self.router, port).await? {
            info!("Restarted iperf3 server for {} on port {}", container, port);
        }

        // Exit status 1 only means nothing was running
        self.docker.exec_in(container, &words(&["pkill", "iperf3"])).await?;

        let args = generate_iperf_args(&device.router_ip, port, duration, bandwidth.as_deref());
        self.docker
            .exec_detached(container, &args)
            .await
            .map_err(|e| TrafficError::Command {
                container: container.clone(),
                message: e.to_string(),
            })?;

        info!(
            "Traffic started in {} against {}:{} for {}s",
            container, device.router_ip, port, duration
        );
        Ok(TrafficSession {
            client: device.name.clone(),
            container: container.clone(),
            server: device.router_ip.clone(),
            port,
            duration,
            bandwidth,
        })
    }

    /// Stop the session; returns whether one was running
    pub async fn stop(&self, device: &Device) -> Result<bool, TrafficError> {
        let out = self
            .docker
            .exec_in(&device.container_name, &words(&["pkill", "iperf3"]))
            .await?;
        match out.status {
            0 => {
                info!("Traffic stopped in {}", device.container_name);
                Ok(true)
            }
            1 => Ok(false),
            _ => Err(TrafficError::Command {
                container: device.container_name.clone(),
                message: out.combined(),
            }),
        }
    }

    pub async fn is_active(&self, device: &Device) -> bool {
        match self
            .docker
            .exec_in(&device.container_name, &words(&["pgrep", "iperf3"]))
            .await
        {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("pgrep in {} failed: {}", device.container_name, e);
                false
            }
        }
    }

    /// Active flag per device name
    pub async fn status(&self, devices: &[Device]) -> BTreeMap<String, bool> {
        let checks = devices.iter().map(|d| async move {
            let active = d.is_running() && self.is_active(d).await;
            (d.name.clone(), active)
        });
        join_all(checks).await.into_iter().collect()
    }
}
