//! Host-resource sentinel.
//!
//! Samples host CPU/RAM/disk on an interval and publishes an admission
//! level over a watch channel. On entering RED it pauses every running
//! icarus sandbox; on leaving RED it resumes them. It never terminates or
//! destroys sandboxes.
//!
//! Phase timers are wall-clock, so an extended pause can expire a paused
//! job's deadline and convert the pause into a phase-timeout failure.
//! That is the intended behavior.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::sync::{Mutex, RwLock, watch};

use crate::config::SentinelConfig;
use crate::sandbox::{SANDBOX_NAME_PREFIX, SandboxDriver, SandboxId, SandboxState};

/// Host pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionLevel {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for AdmissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionLevel::Green => f.write_str("green"),
            AdmissionLevel::Yellow => f.write_str("yellow"),
            AdmissionLevel::Red => f.write_str("red"),
        }
    }
}

/// One host sample. Disk is reported in stats but does not enter the
/// level decision; disk-full surfaces as sandbox write failures instead.
#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

impl Default for HostStats {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            ram_percent: 0.0,
            disk_percent: 0.0,
            sampled_at: Utc::now(),
        }
    }
}

/// Classify a sample against the configured thresholds. Values exactly at
/// a threshold land on the higher level.
pub fn classify(stats: &HostStats, yellow: f64, red: f64) -> AdmissionLevel {
    let pressure = stats.cpu_percent.max(stats.ram_percent);
    if pressure >= red {
        AdmissionLevel::Red
    } else if pressure >= yellow {
        AdmissionLevel::Yellow
    } else {
        AdmissionLevel::Green
    }
}

/// Source of host samples; swapped out in tests.
pub trait HostSampler: Send {
    fn sample(&mut self) -> HostStats;
}

/// `sysinfo`-backed sampler.
pub struct SysinfoSampler {
    system: System,
    disks: Disks,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> HostStats {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_percent = self.system.global_cpu_usage() as f64;

        let total_mem = self.system.total_memory() as f64;
        let ram_percent = if total_mem > 0.0 {
            self.system.used_memory() as f64 / total_mem * 100.0
        } else {
            0.0
        };

        let (total_disk, avail_disk) = self
            .disks
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });
        let disk_percent = if total_disk > 0 {
            (total_disk - avail_disk) as f64 / total_disk as f64 * 100.0
        } else {
            0.0
        };

        HostStats {
            cpu_percent,
            ram_percent,
            disk_percent,
            sampled_at: Utc::now(),
        }
    }
}

/// The sentinel task. Owns `paused_set` exclusively; everyone else only
/// reads the level through the watch channel.
pub struct Sentinel {
    config: SentinelConfig,
    driver: Arc<dyn SandboxDriver>,
    sampler: Mutex<Box<dyn HostSampler>>,
    level_tx: watch::Sender<AdmissionLevel>,
    stats: RwLock<HostStats>,
    paused: Mutex<Vec<SandboxId>>,
}

impl Sentinel {
    pub fn new(config: SentinelConfig, driver: Arc<dyn SandboxDriver>) -> Self {
        Self::with_sampler(config, driver, Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(
        config: SentinelConfig,
        driver: Arc<dyn SandboxDriver>,
        sampler: Box<dyn HostSampler>,
    ) -> Self {
        let (level_tx, _) = watch::channel(AdmissionLevel::Green);
        Self {
            config,
            driver,
            sampler: Mutex::new(sampler),
            level_tx,
            stats: RwLock::new(HostStats::default()),
            paused: Mutex::new(Vec::new()),
        }
    }

    /// Receiver for level changes; the scheduler wakes on these.
    pub fn subscribe(&self) -> watch::Receiver<AdmissionLevel> {
        self.level_tx.subscribe()
    }

    /// Current admission level.
    pub fn level(&self) -> AdmissionLevel {
        *self.level_tx.borrow()
    }

    /// Latest host sample.
    pub async fn stats(&self) -> HostStats {
        self.stats.read().await.clone()
    }

    /// Run the poll loop until the process exits. A disabled sentinel
    /// leaves the level at GREEN forever and returns immediately.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("sentinel disabled; admission level pinned to green");
            return;
        }

        tracing::info!(
            interval = ?self.config.poll_interval(),
            yellow = self.config.yellow_threshold,
            red = self.config.red_threshold,
            "sentinel started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    /// One sample-classify-react step. Factored out so tests can drive
    /// the sentinel without waiting on timers.
    pub async fn poll_once(&self) {
        let sample = self.sampler.lock().await.sample();
        let new_level = classify(
            &sample,
            self.config.yellow_threshold,
            self.config.red_threshold,
        );
        *self.stats.write().await = sample;

        let old_level = self.level();
        if new_level == old_level {
            return;
        }

        if new_level == AdmissionLevel::Red {
            self.pause_all().await;
        } else if old_level == AdmissionLevel::Red {
            self.resume_all().await;
        }

        tracing::info!(from = %old_level, to = %new_level, "admission level changed");
        let _ = self.level_tx.send(new_level);
    }

    async fn pause_all(&self) {
        let sandboxes = match self.driver.list(SANDBOX_NAME_PREFIX).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("sentinel cannot enumerate sandboxes: {}", e);
                return;
            }
        };

        let mut paused = self.paused.lock().await;
        for id in sandboxes {
            match self.driver.inspect(&id).await {
                Ok(SandboxState::Running) => {}
                _ => continue,
            }
            match self.driver.pause(&id).await {
                Ok(()) => {
                    tracing::info!(sandbox = %id, "paused worker under red pressure");
                    paused.push(id);
                }
                Err(e) => tracing::warn!(sandbox = %id, "pause failed: {}", e),
            }
        }
    }

    async fn resume_all(&self) {
        let drained: Vec<SandboxId> = self.paused.lock().await.drain(..).collect();
        for id in drained {
            match self.driver.unpause(&id).await {
                Ok(()) => tracing::info!(sandbox = %id, "resumed worker"),
                // The engine may have killed it while paused (phase timeout).
                Err(e) => tracing::debug!(sandbox = %id, "unpause skipped: {}", e),
            }
        }
    }

    /// Number of sandboxes currently held paused by the sentinel.
    pub async fn paused_count(&self) -> usize {
        self.paused.lock().await.len()
    }
}

/// Scripted sampler for tests.
pub struct ScriptedSampler {
    samples: VecDeque<HostStats>,
    last: HostStats,
}

impl ScriptedSampler {
    pub fn new(samples: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            samples: samples
                .into_iter()
                .map(|(cpu, ram)| HostStats {
                    cpu_percent: cpu,
                    ram_percent: ram,
                    disk_percent: 0.0,
                    sampled_at: Utc::now(),
                })
                .collect(),
            last: HostStats::default(),
        }
    }
}

impl HostSampler for ScriptedSampler {
    fn sample(&mut self) -> HostStats {
        if let Some(next) = self.samples.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}
