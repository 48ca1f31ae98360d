//! Configuration types for accelet

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{AcceletError, AcceletResult};
use crate::resource::{AcceleratorResource, WorkerType};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Fair scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Task launcher configuration
    pub launcher: LauncherConfig,
    /// Event dispatcher configuration
    pub dispatcher: DispatcherConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Physical accelerators installed on this node, in index order
    pub accelerators: Vec<AcceleratorConfig>,
    /// Programs run for each workload
    pub workloads: BTreeMap<String, WorkloadConfig>,
}

impl DaemonConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> AcceletResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AcceletError::Config(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> AcceletResult<Self> {
        let config: DaemonConfig = toml::from_str(content)
            .map_err(|e| AcceletError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> AcceletResult<()> {
        if self.accelerators.is_empty() {
            return Err(AcceletError::Config(
                "No accelerator configured; add at least one [[accelerators]] entry".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for accelerator in &self.accelerators {
            if !ids.insert(accelerator.id.as_str()) {
                return Err(AcceletError::Config(format!(
                    "Duplicate accelerator id: {}",
                    accelerator.id
                )));
            }
        }
        let bases = core_index_bases(&self.accelerators)?;
        for (accelerator, base) in self.accelerators.iter().zip(bases) {
            accelerator.resources(base)?;
        }

        if let Some(workload) = self.workloads.keys().find(|w| !is_workload_name_valid(w)) {
            return Err(AcceletError::Config(format!(
                "Illegal workload name {:?} in [workloads]",
                workload
            )));
        }

        if self.launcher.threads == 0 {
            return Err(AcceletError::Config(
                "launcher.threads must be at least 1".to_string(),
            ));
        }

        if !is_weight_valid(self.scheduler.default_weight) {
            return Err(AcceletError::Config(
                "scheduler.default_weight must be positive".to_string(),
            ));
        }
        if let Some((workload, weight)) = self
            .scheduler
            .weights
            .iter()
            .find(|(_, w)| !is_weight_valid(**w))
        {
            return Err(AcceletError::Config(format!(
                "Weight of workload {} must be positive, got {}",
                workload, weight
            )));
        }

        Ok(())
    }
}

/// Whether `name` can be used as a workload.
///
/// Workloads become the first segment of queue names, so they must be
/// non-empty, free of surrounding whitespace and dots, and must not shadow
/// the root queue.
pub fn is_workload_name_valid(name: &str) -> bool {
    !name.is_empty() && name.trim() == name && !name.contains('.') && name != "root"
}

fn is_weight_valid(weight: f32) -> bool {
    weight.is_finite() && weight > 0.0
}

/// Node-wide core id offset of every card, in configuration order
pub fn core_index_bases(accelerators: &[AcceleratorConfig]) -> AcceletResult<Vec<i32>> {
    let mut bases = Vec::with_capacity(accelerators.len());
    let mut base: i32 = 0;
    for accelerator in accelerators {
        bases.push(base);
        base = base.checked_add(accelerator.core_span()?).ok_or_else(|| {
            AcceletError::Config(format!(
                "Core ids of accelerator {} overflow the node-wide core range",
                accelerator.id
            ))
        })?;
    }
    Ok(bases)
}

/// Fair scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduling passes in milliseconds
    pub interval_ms: u64,
    /// Weight of workloads without an explicit entry
    pub default_weight: f32,
    /// Fair-share weight per workload
    pub weights: BTreeMap<String, f32>,
}

impl SchedulerConfig {
    /// Fair-share weight of a workload
    pub fn weight(&self, workload: &str) -> f32 {
        self.weights
            .get(workload)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            default_weight: 1.0,
            weights: BTreeMap::new(),
        }
    }
}

/// Task launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Maximum number of tasks executing at once
    pub threads: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self { threads: 20 }
    }
}

/// Event dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Terminate the process when an event cannot be dispatched
    pub exit_on_error: bool,
    /// Upper bound on draining and joining the dispatcher at shutdown
    pub stop_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            exit_on_error: true,
            stop_timeout_ms: 5000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// One physical accelerator card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    /// Hardware id, e.g. "fpga-210203A03486A"
    pub id: String,
    /// Device kind
    #[serde(default)]
    pub worker: WorkerType,
    /// Core frequency in MHz per workload
    #[serde(default)]
    pub frequencies: BTreeMap<String, i32>,
    /// Cores of the card
    #[serde(default)]
    pub cores: Vec<CoreConfig>,
}

impl AcceleratorConfig {
    /// Build the card's total capability, numbering cores from `core_index_base`
    pub fn resources(&self, core_index_base: i32) -> AcceletResult<Vec<AcceleratorResource>> {
        if self.cores.is_empty() {
            return Err(AcceletError::Config(format!(
                "Accelerator {} has no cores",
                self.id
            )));
        }

        if let Some(workload) = self.frequencies.keys().find(|w| !is_workload_name_valid(w)) {
            return Err(AcceletError::Config(format!(
                "Accelerator {} has a frequency for illegal workload name {:?}",
                self.id, workload
            )));
        }

        let mut core_ids = HashSet::new();
        let mut resources = Vec::with_capacity(self.cores.len());
        for core in &self.cores {
            if core.id < 0 {
                return Err(AcceletError::Config(format!(
                    "Accelerator {} declares negative core id {}",
                    self.id, core.id
                )));
            }
            if !core_ids.insert(core.id) {
                return Err(AcceletError::Config(format!(
                    "Accelerator {} declares core {} twice",
                    self.id, core.id
                )));
            }
            if !is_workload_name_valid(&core.workload) {
                return Err(AcceletError::Config(format!(
                    "Core {} of accelerator {} has illegal workload name {:?}",
                    core.id, self.id, core.workload
                )));
            }
            let memory = core.memory_mb.unwrap_or(0);
            if memory < 0 {
                return Err(AcceletError::Config(format!(
                    "Core {} of accelerator {} declares negative memory {}",
                    core.id, self.id, memory
                )));
            }
            let core_id = core_index_base.checked_add(core.id).ok_or_else(|| {
                AcceletError::Config(format!(
                    "Core {} of accelerator {} overflows the node-wide core range",
                    core.id, self.id
                ))
            })?;
            let frequency = self.frequencies.get(&core.workload).ok_or_else(|| {
                AcceletError::Config(format!(
                    "Accelerator {} has no frequency entry for workload {}",
                    self.id, core.workload
                ))
            })?;
            resources.push(AcceleratorResource::new(
                core.workload.clone(),
                core_id,
                *frequency,
                memory,
            ));
        }
        Ok(resources)
    }

    /// Width of the node-wide core id range taken by this card
    pub fn core_span(&self) -> AcceletResult<i32> {
        let highest = self.cores.iter().map(|c| c.id).max().unwrap_or(-1);
        highest.checked_add(1).ok_or_else(|| {
            AcceletError::Config(format!(
                "Accelerator {} declares core id {} which leaves no room for a span",
                self.id, highest
            ))
        })
    }
}

/// One core of an accelerator card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Core id local to the card
    pub id: i32,
    /// Workload the core is programmed for
    pub workload: String,
    /// Core memory in MB
    #[serde(default)]
    pub memory_mb: Option<i64>,
}

/// Program executed for tasks of one workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Executable path
    pub command: PathBuf,
    /// Extra arguments
    #[serde(default)]
    pub args: Vec<String>,
}
