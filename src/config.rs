// clockfeed: Configuration
//
// Layered env > file > defaults, implemented with the `config` crate since
// this is a single std binary rather than a `no_std`-capable library crate.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShmSourceType {
    Complete,
    Tod,
    Pps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MasterClockClass {
    Locked,
    Holdover,
    Freerunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MasterTimeSource {
    Atomic,
    Gps,
    Ptp,
    Ntp,
    Oscillator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MasterAccuracy {
    Unknown,
    Ns(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutlierFilterType {
    Disabled,
    StdDev,
}

/// Traceability bits: subset of {time,freq}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traceability {
    pub time: bool,
    pub freq: bool,
}

/// How the servo reacts to a qualifying large offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepPolicy {
    /// Never step; always slew, no matter the offset.
    SlewOnly,
    /// Step on every qualifying large offset, forever.
    SlewAndStep,
    /// Step once, on the instance's first activation, then behave like
    /// `SlewOnly`.
    StepAtStartup,
    /// Step only when the offset is negative (the local clock is ahead).
    StepForward,
}

/// Per-instance configuration, one block per SHM servo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmInstanceConfig {
    pub name: String,
    pub interface: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_sync_threshold_ns")]
    pub sync_threshold_ns: u64,
    pub shm_source_type: ShmSourceType,
    /// Sibling instance name, or `None` for "auto".
    #[serde(default)]
    pub time_of_day: Option<String>,
    pub master_clock_class: MasterClockClass,
    pub master_time_source: MasterTimeSource,
    #[serde(default)]
    pub master_accuracy: Option<MasterAccuracy>,
    #[serde(default)]
    pub master_traceability: Traceability,
    #[serde(default = "default_steps_removed")]
    pub steps_removed: u8,
    #[serde(default)]
    pub shm_delay_ns: i64,
    pub pid_filter_p: f64,
    pub pid_filter_i: f64,
    #[serde(default)]
    pub outlier_filter_type: OutlierFilterType,
    #[serde(default = "default_outlier_filter_size")]
    pub outlier_filter_size: usize,
    #[serde(default)]
    pub outlier_filter_adaption: f64,
    #[serde(default = "default_fir_filter_size")]
    pub fir_filter_size: usize,
    #[serde(default = "default_step_policy")]
    pub step_policy: StepPolicy,
}

fn default_priority() -> u8 {
    128
}
fn default_sync_threshold_ns() -> u64 {
    100_000
}
fn default_steps_removed() -> u8 {
    1
}
fn default_outlier_filter_size() -> usize {
    crate::filters::peirce::MIN_SIZE
}
fn default_fir_filter_size() -> usize {
    1
}
fn default_step_policy() -> StepPolicy {
    StepPolicy::SlewOnly
}

impl Default for OutlierFilterType {
    fn default() -> Self {
        OutlierFilterType::Disabled
    }
}

impl ShmInstanceConfig {
    /// Validate the range constraints called out for each field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.trim().is_empty() {
            return Err(ConfigError::MissingField("interface"));
        }
        if !(0.0..=1.0).contains(&self.pid_filter_p) {
            return Err(ConfigError::OutOfRange {
                field: "pid_filter_p",
                detail: format!("{} not in [0,1]", self.pid_filter_p),
            });
        }
        if !(0.0..=1.0).contains(&self.pid_filter_i) {
            return Err(ConfigError::OutOfRange {
                field: "pid_filter_i",
                detail: format!("{} not in [0,1]", self.pid_filter_i),
            });
        }
        if !(crate::filters::peirce::MIN_SIZE..=crate::filters::peirce::MAX_SIZE)
            .contains(&self.outlier_filter_size)
        {
            return Err(ConfigError::OutOfRange {
                field: "outlier_filter_size",
                detail: format!(
                    "{} not in [{},{}]",
                    self.outlier_filter_size,
                    crate::filters::peirce::MIN_SIZE,
                    crate::filters::peirce::MAX_SIZE
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.outlier_filter_adaption) {
            return Err(ConfigError::OutOfRange {
                field: "outlier_filter_adaption",
                detail: format!("{} not in [0,1]", self.outlier_filter_adaption),
            });
        }
        if !(crate::filters::fir::MIN_SIZE..=crate::filters::fir::MAX_SIZE)
            .contains(&self.fir_filter_size)
        {
            return Err(ConfigError::OutOfRange {
                field: "fir_filter_size",
                detail: format!(
                    "{} not in [{},{}]",
                    self.fir_filter_size,
                    crate::filters::fir::MIN_SIZE,
                    crate::filters::fir::MAX_SIZE
                ),
            });
        }
        Ok(())
    }
}

/// Top-level daemon configuration: one or more SHM instances plus the
/// global feed poll floor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub instances: Vec<ShmInstanceConfig>,
}

impl DaemonConfig {
    /// Load layered config: env (`CLOCKFEED_*`) over an optional TOML
    /// file over built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CLOCKFEED")
                .separator("__")
                .try_parsing(true),
        );
        let built = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config: DaemonConfig = built
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        for instance in &config.instances {
            instance.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for instance in &config.instances {
            if !seen.insert(instance.interface.clone()) {
                return Err(ConfigError::DuplicateInstance(instance.interface.clone()));
            }
        }
        Ok(config)
    }
}
