//! Periodic sampling of class counters on the shaping endpoint

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::snapshot::{ClassStats, Connection, DirectionalStats, InterfaceStats, MetricsSnapshot};
use crate::rules::ActiveRule;
use crate::runtime::docker::Endpoint;
use crate::shaping::hierarchy::{leaf_class_ids, DEFAULT_MINOR, DOWNSTREAM_MAJOR, UPSTREAM_MAJOR};
use crate::shaping::parsers::{parse_connections, parse_tc_classes, TcClass};
use crate::shaping::units::{parse_rate, round2, to_mbps};
use crate::store::{Device, Store};

/// Cumulative byte counters of one device at one instant
#[derive(Debug, Clone)]
pub struct Baseline {
    at: Instant,
    bytes: HashMap<String, u64>,
}

/// Turn cumulative counters into rates against the previous sample.
///
/// No previous sample, no elapsed time, or a counter that went backwards
/// all yield a rate of zero; the returned baseline replaces the old one.
pub fn differentiate(
    prev: Option<&Baseline>,
    classes: &[TcClass],
    major: &str,
    now: Instant,
) -> (DirectionalStats, Baseline) {
    let leaves = leaf_class_ids(major);
    let elapsed = prev
        .map(|p| now.saturating_duration_since(p.at).as_secs_f64())
        .unwrap_or(0.0);

    let mut stats = DirectionalStats::default();
    let mut baseline = Baseline {
        at: now,
        bytes: HashMap::new(),
    };
    let mut total_bps = 0.0;

    for class in classes.iter().filter(|c| leaves.contains(&c.class_id)) {
        let bps = match prev.and_then(|p| p.bytes.get(&class.class_id)) {
            Some(&before) if elapsed > 0.0 && class.bytes >= before => {
                (class.bytes - before) as f64 * 8.0 / elapsed
            }
            _ => 0.0,
        };
        total_bps += bps;
        baseline.bytes.insert(class.class_id.clone(), class.bytes);

        stats.packets_sent += class.packets;
        stats.packets_dropped += class.drops;
        stats.classes.push(ClassStats {
            class_id: class.class_id.clone(),
            rate: class.rate.clone(),
            ceil: class.ceil.clone(),
            bytes: class.bytes,
            packets: class.packets,
            drops: class.drops,
            overlimits: class.overlimits,
            bandwidth_mbps: round2(bps / 1_000_000.0),
        });
    }

    stats.bandwidth_mbps = round2(total_bps / 1_000_000.0);

    let low = format!("{}:{}", major, DEFAULT_MINOR);
    let ceiling = classes
        .iter()
        .find(|c| c.class_id == low)
        .and_then(|c| parse_rate(&c.ceil))
        .filter(|&bits| bits > 0);
    if let Some(ceiling) = ceiling {
        let percent = total_bps / ceiling as f64 * 100.0;
        stats.utilization_percent = round2(percent.clamp(0.0, 100.0));
    }

    debug!(
        "{} leaf classes, {:.2} Mbit/s of {:?} Mbit/s",
        stats.classes.len(),
        stats.bandwidth_mbps,
        ceiling.map(to_mbps)
    );
    (stats, baseline)
}

fn command(words: &[&str]) -> Vec<String> {
    words.iter().map(|s| s.to_string()).collect()
}

pub struct Sampler {
    store: Arc<Store>,
    router: Endpoint,
    timeout: Duration,
    baselines: HashMap<String, Baseline>,
}

impl Sampler {
    pub fn new(store: Arc<Store>, router: Endpoint, timeout: Duration) -> Self {
        Self {
            store,
            router,
            timeout,
            baselines: HashMap::new(),
        }
    }

    /// `tc -s class show` on `dev`, `None` on error or timeout
    async fn read_classes(&self, dev: &str) -> Option<Vec<TcClass>> {
        let cmd = command(&["tc", "-s", "class", "show", "dev", dev]);
        match self.router.run_with_timeout(&cmd, self.timeout).await {
            Ok(out) if out.success() => Some(parse_tc_classes(&out.stdout)),
            Ok(out) => {
                debug!("Skipping {}: {}", dev, out.combined());
                None
            }
            Err(e) => {
                debug!("Skipping {}: {}", dev, e);
                None
            }
        }
    }

    async fn read_connections(&self, devices: &[&Device]) -> Vec<Connection> {
        let cmd = command(&["ss", "-tn", "state", "established"]);
        let out = match self.router.run_with_timeout(&cmd, self.timeout).await {
            Ok(out) if out.success() => out,
            _ => return Vec::new(),
        };
        let by_ip: HashMap<&str, &str> = devices
            .iter()
            .map(|d| (d.ip_address.as_str(), d.name.as_str()))
            .collect();

        parse_connections(&out.stdout)
            .into_iter()
            .map(|conn| Connection {
                client: by_ip.get(conn.remote_ip()).map(|name| name.to_string()),
                protocol: "tcp".to_string(),
                local_addr: conn.local.clone(),
                remote_addr: conn.remote.clone(),
                state: "ESTABLISHED".to_string(),
            })
            .collect()
    }

    /// Take one snapshot. Interfaces that fail or stall are left out.
    pub async fn sample(&mut self) -> MetricsSnapshot {
        let state = self.store.snapshot().await;
        let devices: Vec<&Device> = state
            .devices
            .iter()
            .filter(|d| d.is_running() && d.interface_name.is_some())
            .collect();

        let this = &*self;
        let reads = devices.iter().map(|device| async move {
            let target = device.shaping_target();
            let (down, up) = match &target {
                Some(t) => {
                    let up = async {
                        match &t.ifb_device {
                            Some(ifb) => this.read_classes(ifb).await,
                            None => None,
                        }
                    };
                    futures::join!(this.read_classes(&t.interface), up)
                }
                None => (None, None),
            };
            (*device, target, down, up)
        });
        let (results, connections) =
            futures::join!(join_all(reads), this.read_connections(&devices));

        let now = Instant::now();
        let mut snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            connections,
            ..MetricsSnapshot::empty()
        };
        let mut live = Vec::new();

        for (device, target, down, up) in results {
            let (Some(target), Some(down)) = (target, down) else {
                continue;
            };
            let (downstream, base) =
                differentiate(self.baselines.get(&target.interface), &down, DOWNSTREAM_MAJOR, now);
            self.baselines.insert(target.interface.clone(), base);
            live.push(target.interface.clone());

            let upstream = match (&target.ifb_device, &up) {
                (Some(ifb), Some(classes)) => {
                    let (stats, base) =
                        differentiate(self.baselines.get(ifb), classes, UPSTREAM_MAJOR, now);
                    self.baselines.insert(ifb.clone(), base);
                    live.push(ifb.clone());
                    Some(stats)
                }
                _ => None,
            };

            let up_classes = up.as_deref().unwrap_or(&[]);
            if let Some(rule) = ActiveRule::from_classes(device, &target.interface, &down, up_classes) {
                snapshot.rules.push(rule);
            }
            snapshot.interfaces.insert(
                target.interface.clone(),
                InterfaceStats {
                    name: target.interface.clone(),
                    client: device.name.clone(),
                    container: device.container_name.clone(),
                    ifb_device: target.ifb_device.clone(),
                    downstream,
                    upstream,
                },
            );
        }

        // Forget devices that went away so a reused name starts fresh
        self.baselines.retain(|dev, _| live.contains(dev));
        snapshot
    }
}

/// Running sampler task
pub struct SamplerHandle {
    pub shutdown: watch::Sender<bool>,
    pub snapshots: watch::Receiver<Arc<MetricsSnapshot>>,
    pub task: JoinHandle<()>,
}

/// Spawn the sampling loop. Each tick replaces the latest snapshot; slow
/// subscribers only ever see the newest one.
pub fn spawn_sampler(mut sampler: Sampler, interval: Duration) -> SamplerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MetricsSnapshot::empty()));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Metrics sampler started ({:?} interval)", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = sampler.sample().await;
                    snapshot_tx.send_replace(Arc::new(snapshot));
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Metrics sampler shutting down");
                        break;
                    }
                }
            }
        }
    });

    SamplerHandle {
        shutdown: shutdown_tx,
        snapshots: snapshot_rx,
        task,
    }
}
