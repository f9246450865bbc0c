use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    fs,
    ops::{Bound, RangeBounds},
    path::Path,
};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model parameters (mutable between steps).
    pub model: ModelParams,
    /// Initialization parameters (fixed for the lifetime of an engine).
    pub init: InitParams,
    /// Output parameters.
    pub output: OutputParams,
}

/// Model parameters.
///
/// Every field may be changed between steps without rebuilding the engine;
/// the change takes effect on the next step. `lockdown` and `speed` only
/// shape the velocities of agents created at construction or reset.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Arena width.
    pub width: f64,
    /// Arena height.
    pub height: f64,

    /// Maximum distance at which transmission can occur.
    pub infection_radius: f64,
    /// Probability of transmission per infected-susceptible contact and step.
    pub infection_prob: f64,
    /// Number of steps an agent stays infected.
    pub recovery_time: u32,

    /// Fraction of agents initially immune.
    pub vacc_percent: f64,

    /// Nominal agent speed.
    ///
    /// Reflections assume `speed` is small compared to `width` and `height`:
    /// an agent may cross at most one wall per axis per step.
    pub speed: f64,
    /// Reduce initial agent speeds to a fraction of the nominal speed.
    pub lockdown: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            width: 100.0,
            height: 100.0,
            infection_radius: 2.0,
            infection_prob: 0.3,
            recovery_time: 50,
            vacc_percent: 0.0,
            speed: 1.0,
            lockdown: false,
        }
    }
}

/// Initialization parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct InitParams {
    /// Number of agents.
    pub population: usize,
    /// Random number generator seed (non-deterministic if absent).
    pub seed: Option<u64>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            population: 200,
            seed: None,
        }
    }
}

/// Output parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutputParams {
    /// Number of steps between saved frames.
    pub steps_per_save: usize,
    /// Number of frames written per trajectory file.
    pub saves_per_file: usize,
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate a [`Config`] from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.model
            .validate()
            .context("invalid model parameters")?;
        self.init
            .validate()
            .context("invalid initialization parameters")?;
        self.output
            .validate()
            .context("invalid output parameters")?;
        Ok(())
    }
}

impl ModelParams {
    /// Check that every parameter is within its allowed range.
    pub fn validate(&self) -> Result<()> {
        check_num(self.width, POSITIVE).context("invalid width")?;
        check_num(self.height, POSITIVE).context("invalid height")?;

        check_num(self.infection_radius, 0.0..).context("invalid infection radius")?;
        check_num(self.infection_prob, 0.0..=1.0).context("invalid infection probability")?;
        check_num(self.recovery_time, 1..).context("invalid recovery time")?;

        check_num(self.vacc_percent, 0.0..=1.0).context("invalid vaccinated fraction")?;

        check_num(self.speed, 0.0..).context("invalid speed")?;

        Ok(())
    }
}

impl InitParams {
    pub fn validate(&self) -> Result<()> {
        check_num(self.population, 1..).context("invalid population")?;
        Ok(())
    }
}

impl OutputParams {
    pub fn validate(&self) -> Result<()> {
        check_num(self.steps_per_save, 1..1_000_000).context("invalid number of steps per save")?;
        check_num(self.saves_per_file, 1..1_000_000).context("invalid number of saves per file")?;
        Ok(())
    }
}

const POSITIVE: (Bound<f64>, Bound<f64>) = (Bound::Excluded(0.0), Bound::Unbounded);

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}
