//! Simulation configuration.

use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Simulation configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Mutations performed by each actor
    pub steps: usize,

    /// Number of editors besides the owner
    pub actors: usize,

    /// Pause between an actor's mutations
    pub tick: Duration,

    /// Shortest relay delay
    pub delay_min: Duration,

    /// Longest relay delay
    pub delay_max: Duration,

    /// Add an editor that tampers with its tokens and tries to escalate
    pub adversarial: bool,

    /// RNG seed; random when unset
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            steps: 80,
            actors: 3,
            tick: Duration::from_millis(10),
            delay_min: Duration::from_millis(5),
            delay_max: Duration::from_millis(40),
            adversarial: false,
            seed: None,
        }
    }
}

impl SimConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUILL_SIM_STEPS`: mutations per actor
    /// - `QUILL_SIM_ACTORS`: number of editors
    /// - `QUILL_SIM_TICK_MS`: pause between mutations
    /// - `QUILL_SIM_DELAY_MIN_MS` / `QUILL_SIM_DELAY_MAX_MS`: relay delay range
    /// - `QUILL_SIM_ADVERSARIAL`: `1` or `true` to add a tampering editor
    /// - `QUILL_SIM_SEED`: RNG seed
    ///
    /// # Errors
    ///
    /// Returns error if a variable does not parse or the delay range is empty.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(steps) = std::env::var("QUILL_SIM_STEPS") {
            config.steps = steps.parse().context("Invalid QUILL_SIM_STEPS")?;
        }

        if let Ok(actors) = std::env::var("QUILL_SIM_ACTORS") {
            config.actors = actors.parse().context("Invalid QUILL_SIM_ACTORS")?;
        }

        if let Ok(ms) = std::env::var("QUILL_SIM_TICK_MS") {
            config.tick = Duration::from_millis(ms.parse().context("Invalid QUILL_SIM_TICK_MS")?);
        }

        if let Ok(ms) = std::env::var("QUILL_SIM_DELAY_MIN_MS") {
            config.delay_min =
                Duration::from_millis(ms.parse().context("Invalid QUILL_SIM_DELAY_MIN_MS")?);
        }

        if let Ok(ms) = std::env::var("QUILL_SIM_DELAY_MAX_MS") {
            config.delay_max =
                Duration::from_millis(ms.parse().context("Invalid QUILL_SIM_DELAY_MAX_MS")?);
        }

        if let Ok(flag) = std::env::var("QUILL_SIM_ADVERSARIAL") {
            config.adversarial = parse_flag(&flag).context("Invalid QUILL_SIM_ADVERSARIAL")?;
        }

        if let Ok(seed) = std::env::var("QUILL_SIM_SEED") {
            config.seed = Some(seed.parse().context("Invalid QUILL_SIM_SEED")?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns error if there are no editors, the tick is zero, or
    /// `delay_min > delay_max`.
    pub fn validate(&self) -> Result<()> {
        if self.actors == 0 {
            bail!("at least one editor is required");
        }
        if self.tick.is_zero() {
            bail!("tick must be positive");
        }
        if self.delay_min > self.delay_max {
            bail!(
                "delay range is empty: {:?} > {:?}",
                self.delay_min,
                self.delay_max
            );
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
