//! Device session configuration
//!
//! [`SessionConfig`] controls which device is opened, how long a wait may
//! block before the hang check runs, and how memory registration is retried.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::capability::HwGeneration;
use crate::kernels::AccelerationMode;

pub const ENV_DEVICE_INDEX: &str = "ACCELFORGE_DEVICE_INDEX";
pub const ENV_RECOVERY_TIMEOUT_MS: &str = "ACCELFORGE_RECOVERY_TIMEOUT_MS";
pub const ENV_MAP_RETRY_ITERATIONS: &str = "ACCELFORGE_MAP_RETRY_ITERATIONS";
pub const ENV_MAP_RETRY_DELAY_MS: &str = "ACCELFORGE_MAP_RETRY_DELAY_MS";
pub const ENV_ACCELERATION: &str = "ACCELFORGE_ACCELERATION";
pub const ENV_GENERATION: &str = "ACCELFORGE_GENERATION";

/// Map attempts before a buffer is reported as not mapped
pub const DEFAULT_MAP_RETRY_ITERATIONS: u32 = 200;
pub const DEFAULT_MAP_RETRY_DELAY: Duration = Duration::from_millis(15);
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Invalid configuration value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// How the session picks the kernel acceleration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelerationPreference {
    /// Fastest mode the host supports
    #[default]
    Auto,
    Fixed(AccelerationMode),
}

impl AccelerationPreference {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Some(AccelerationPreference::Auto);
        }
        AccelerationMode::parse(s).map(AccelerationPreference::Fixed)
    }
}

impl fmt::Display for AccelerationPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelerationPreference::Auto => write!(f, "auto"),
            AccelerationPreference::Fixed(mode) => write!(f, "{}", mode),
        }
    }
}

/// Configuration for a [`DeviceSession`](super::DeviceSession)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Index passed to the driver's `open`
    pub device_index: u32,

    /// Upper bound for a single wait before the hang check
    pub recovery_timeout: Duration,

    /// Map attempts while the driver reports the buffer as not yet visible
    pub map_retry_iterations: u32,

    /// Delay between map attempts
    pub map_retry_delay: Duration,

    pub acceleration: AccelerationPreference,

    /// Validate against this generation instead of the one the device reports
    pub generation_override: Option<HwGeneration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            device_index: 0,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            map_retry_iterations: DEFAULT_MAP_RETRY_ITERATIONS,
            map_retry_delay: DEFAULT_MAP_RETRY_DELAY,
            acceleration: AccelerationPreference::Auto,
            generation_override: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device_index(mut self, device_index: u32) -> Self {
        self.device_index = device_index;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set map retry bound and delay
    pub fn with_map_retry(mut self, iterations: u32, delay: Duration) -> Self {
        self.map_retry_iterations = iterations;
        self.map_retry_delay = delay;
        self
    }

    pub fn with_acceleration(mut self, acceleration: AccelerationPreference) -> Self {
        self.acceleration = acceleration;
        self
    }

    pub fn with_generation(mut self, generation: HwGeneration) -> Self {
        self.generation_override = Some(generation);
        self
    }

    /// Defaults overridden by `ACCELFORGE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_DEVICE_INDEX) {
            config.device_index = parse_number(ENV_DEVICE_INDEX, &value)?;
        }
        if let Some(value) = lookup(ENV_RECOVERY_TIMEOUT_MS) {
            let ms: u64 = parse_number(ENV_RECOVERY_TIMEOUT_MS, &value)?;
            if ms == 0 {
                return Err(invalid(ENV_RECOVERY_TIMEOUT_MS, &value, "must be positive"));
            }
            config.recovery_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = lookup(ENV_MAP_RETRY_ITERATIONS) {
            let iterations: u32 = parse_number(ENV_MAP_RETRY_ITERATIONS, &value)?;
            if iterations == 0 {
                return Err(invalid(ENV_MAP_RETRY_ITERATIONS, &value, "must be positive"));
            }
            config.map_retry_iterations = iterations;
        }
        if let Some(value) = lookup(ENV_MAP_RETRY_DELAY_MS) {
            config.map_retry_delay =
                Duration::from_millis(parse_number(ENV_MAP_RETRY_DELAY_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_ACCELERATION) {
            config.acceleration = AccelerationPreference::parse(value.trim()).ok_or_else(|| {
                invalid(ENV_ACCELERATION, &value, "expected auto, generic, sse4.2 or avx2")
            })?;
        }
        if let Some(value) = lookup(ENV_GENERATION) {
            let generation = HwGeneration::parse(value.trim())
                .ok_or_else(|| invalid(ENV_GENERATION, &value, "expected v1, v2 or v3"))?;
            config.generation_override = Some(generation);
        }

        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason,
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(var, value, "not a number"))
}
