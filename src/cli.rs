use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::Settings;
use crate::rules::RuleRecord;
use crate::store::StoreState;

#[derive(Parser, Debug)]
#[command(name = "netshaper")]
#[command(about = "Reconcile device clusters onto isolated networks and shape their traffic")]
#[command(version)]
pub struct Args {
    /// Path to the config file (default: ~/.netshaper/config.yaml)
    #[arg(long, env = "NETSHAPER_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: show effective settings and stored state without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Override the bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Override the desired-state file
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Override the rule record file
    #[arg(long, value_name = "FILE")]
    pub rules_file: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Run against an in-memory simulated host instead of docker
    #[arg(long)]
    pub simulate: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded settings
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(ref addr) = self.bind_addr {
            settings.bind_addr = addr.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(ref path) = self.state_file {
            settings.state_file = path.clone();
        }
        if let Some(ref path) = self.rules_file {
            settings.rules_file = path.clone();
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format the dry-run report: effective settings, desired state and rule
/// records. Pure function - returns a formatted string.
pub fn format_dry_run(settings: &Settings, state: &StoreState, records: &[RuleRecord]) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "netshaper v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));

    output.push_str("Settings:\n");
    output.push_str(&format!(
        "  Listen:       {}:{}\n",
        settings.bind_addr, settings.port
    ));
    output.push_str(&format!("  State file:   {}\n", settings.state_file.display()));
    output.push_str(&format!("  Rules file:   {}\n", settings.rules_file.display()));
    output.push_str(&format!("  Router:       {}\n", settings.router_container));
    output.push_str(&format!(
        "  Slots:        {}.{{{}..{}}}.0/24 (prefix '{}')\n",
        settings.naming.subnet_base,
        settings.naming.slot_min,
        settings.naming.slot_max,
        settings.naming.prefix
    ));
    output.push_str(&format!(
        "  Timeouts:     command {}s, sample {}ms every {}ms\n",
        settings.command_timeout_secs, settings.sample_timeout_ms, settings.sample_interval_ms
    ));
    output.push('\n');

    output.push_str(&format!("Clusters ({}):\n", state.clusters.len()));
    for cluster in &state.clusters {
        let marker = if cluster.active { "active" } else { "inactive" };
        output.push_str(&format!("  [{}] {} ({})\n", cluster.id, cluster.name, marker));
        for device in state.devices.iter().filter(|d| d.cluster_id == cluster.id) {
            output.push_str(&format!(
                "    - {} slot {} {} {}",
                device.name, device.slot, device.ip_address, device.status
            ));
            if let Some(ref iface) = device.interface_name {
                output.push_str(&format!(" on {}", iface));
            }
            output.push('\n');
        }
    }
    output.push('\n');

    output.push_str(&format!("Rule records ({}):\n", records.len()));
    for record in records {
        output.push_str(&format!(
            "  {} down {}/{}",
            record.client, record.downstream_rate, record.downstream_ceil
        ));
        if let (Some(rate), Some(ceil)) = (&record.upstream_rate, &record.upstream_ceil) {
            output.push_str(&format!(" up {}/{}", rate, ceil));
        }
        output.push('\n');
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Remove --dry-run to serve.\n");

    output
}
