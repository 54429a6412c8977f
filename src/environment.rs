//! Environmental management
//!
//! Process-wide settings of a harness run. The configuration is read once at process start
//! and handed to the `LifecycleCoordinator` by value.
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable selecting the run mode
pub const MODE_VAR: &str = "MPI_HARNESS_MODE";

/// Which half of the suite a run executes
///
/// MPI-marked tests and ordinary tests never run in the same pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Run unmarked tests, skip MPI-marked ones
    #[default]
    Ordinary,
    /// Run MPI-marked tests, skip unmarked ones
    Mpi,
}

impl RunMode {
    /// Whether a test runs in this mode, or the reason it is skipped.
    pub fn admits(self, mpi_marked: bool) -> std::result::Result<(), &'static str> {
        match (self, mpi_marked) {
            (RunMode::Mpi, true) | (RunMode::Ordinary, false) => Ok(()),
            (RunMode::Mpi, false) => Err("Skipping non-mpi test"),
            (RunMode::Ordinary, true) => Err("MPIRunner not enabled"),
        }
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<RunMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mpi" | "1" | "true" | "on" => Ok(RunMode::Mpi),
            "ordinary" | "" | "0" | "false" | "off" => Ok(RunMode::Ordinary),
            _ => Err(Error::InvalidRunMode(s.to_owned())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Ordinary => "ordinary",
            RunMode::Mpi => "mpi",
        })
    }
}

/// Settings of a harness run
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Which tests run
    #[serde(default)]
    pub mode: RunMode,
}

impl HarnessConfig {
    /// A configuration running tests of `mode`
    pub fn new(mode: RunMode) -> HarnessConfig {
        HarnessConfig { mode }
    }

    /// Read the configuration from the process environment.
    ///
    /// An unset `MPI_HARNESS_MODE` selects `RunMode::Ordinary`.
    pub fn from_env() -> Result<HarnessConfig> {
        HarnessConfig::from_mode_value(env::var(MODE_VAR).ok().as_deref())
    }

    fn from_mode_value(value: Option<&str>) -> Result<HarnessConfig> {
        let mode = value.map(str::parse).transpose()?.unwrap_or_default();
        Ok(HarnessConfig { mode })
    }
}
