//! Fluent builder for [`Scheduler`] construction.
//!
//! Settings resolve in this order, highest priority first:
//!
//! 1. values set through builder methods
//! 2. `SPINDLE_*` environment variables, when [`SchedulerBuilder::from_env`] is used
//! 3. the defaults of [`SchedulerConfig`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `SPINDLE_BATCH_SIZE` | `usize` | `batch_size` |
//! | `SPINDLE_POOL_CAPACITY` | `usize` | `pool_capacity` |
//! | `SPINDLE_MAX_IDLE_WAIT_MS` | `u64` | `max_idle_wait` |
//! | `SPINDLE_ITERATION_LIMIT` | `usize` | `iteration_limit` |

use crate::error::ConfigError;
use crate::runtime::Scheduler;
use crate::runtime::pool::DEFAULT_POOL_CAPACITY;

use std::time::Duration;

pub const ENV_BATCH_SIZE: &str = "SPINDLE_BATCH_SIZE";
pub const ENV_POOL_CAPACITY: &str = "SPINDLE_POOL_CAPACITY";
pub const ENV_MAX_IDLE_WAIT_MS: &str = "SPINDLE_MAX_IDLE_WAIT_MS";
pub const ENV_ITERATION_LIMIT: &str = "SPINDLE_ITERATION_LIMIT";

pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

/// Tuning knobs of a [`Scheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Tasks stepped per iteration before the loop waits for I/O.
    pub batch_size: usize,
    /// Iterations per [`Scheduler::run`] call; `None` runs until out of work.
    pub iteration_limit: Option<usize>,
    /// Retired tasks kept for reuse.
    pub pool_capacity: usize,
    /// Ceiling of the adaptive wait used while only sleepers are pending.
    pub max_idle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            iteration_limit: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_idle_wait: DEFAULT_MAX_IDLE_WAIT,
        }
    }
}

impl SchedulerConfig {
    /// Defaults with every `SPINDLE_*` variable that is set applied on top.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(read_env)?;
        Ok(config)
    }

    /// Rejects values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.iteration_limit == Some(0) {
            return Err(ConfigError::ZeroIterationLimit);
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::ZeroPoolCapacity);
        }

        Ok(())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = parse_usize(ENV_BATCH_SIZE, &val)?;
        }
        if let Some(val) = lookup(ENV_POOL_CAPACITY) {
            self.pool_capacity = parse_usize(ENV_POOL_CAPACITY, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_IDLE_WAIT_MS) {
            let ms = val.trim().parse::<u64>().map_err(|e| ConfigError::InvalidEnv {
                var: ENV_MAX_IDLE_WAIT_MS,
                value: val.clone(),
                reason: format!("expected milliseconds ({e})"),
            })?;
            self.max_idle_wait = Duration::from_millis(ms);
        }
        if let Some(val) = lookup(ENV_ITERATION_LIMIT) {
            self.iteration_limit = Some(parse_usize(ENV_ITERATION_LIMIT, &val)?);
        }

        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidEnv {
            var,
            value: val.to_string(),
            reason: format!("expected unsigned integer ({e})"),
        })
}

/// Builder for constructing [`Scheduler`] instances with a fluent API.
///
/// # Example
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .batch_size(16)
///     .iteration_limit(100)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from [`SchedulerConfig::from_env`] instead of the defaults.
    ///
    /// Call this first: builder methods applied afterwards take precedence.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            config: SchedulerConfig::from_env()?,
        })
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn iteration_limit(mut self, limit: usize) -> Self {
        self.config.iteration_limit = Some(limit);
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    pub fn max_idle_wait(mut self, wait: Duration) -> Self {
        self.config.max_idle_wait = wait;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validates the configuration and constructs the scheduler.
    ///
    /// # Returns
    /// The scheduler, or the first [`ConfigError`] found
    pub fn build(self) -> Result<Scheduler, ConfigError> {
        self.config.validate()?;
        Ok(Scheduler::with_config(self.config))
    }
}
